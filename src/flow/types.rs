use std::collections::HashMap;

use crate::error::{MicroflowError, Result};
use crate::eval::Expression;
use crate::value::Value;

/// Flow 核心类型定义 - 离线编译产物，运行期只读

/// Conventional output layout: output 0 is the unconditional sequence edge.
pub const SEQOUT_INDEX: usize = 0;
/// Counter and Loop signal completion on output 1.
pub const DONE_OUTPUT_INDEX: usize = 1;
/// Switch routes a false condition to output 1.
pub const FALSE_OUTPUT_INDEX: usize = 1;

/// 一组已编译的流程，按下标寻址
#[derive(Clone, Debug, Default)]
pub struct FlowBundle {
    flows: Vec<FlowDefinition>,
    index_by_name: HashMap<String, usize>,
}

impl FlowBundle {
    pub fn new(flows: Vec<FlowDefinition>) -> Self {
        let index_by_name = flows
            .iter()
            .enumerate()
            .map(|(index, flow)| (flow.name.clone(), index))
            .collect();
        Self {
            flows,
            index_by_name,
        }
    }

    pub fn flow(&self, index: usize) -> Result<&FlowDefinition> {
        self.flows
            .get(index)
            .ok_or_else(|| MicroflowError::Logic(format!("flow index {index} out of range")))
    }

    pub fn flow_index(&self, name: &str) -> Option<usize> {
        self.index_by_name.get(name).copied()
    }

    pub fn flows(&self) -> &[FlowDefinition] {
        &self.flows
    }
}

/// 单个流程定义 - 组件与边，被所有 flow state 实例共享
#[derive(Clone, Debug)]
pub struct FlowDefinition {
    pub name: String,
    pub components: Vec<Component>,
    pub variables: Vec<VariableDefinition>,
    /// Offset of the first variable slot in a flow state's values array; the
    /// slots below it belong to component inputs.
    pub variable_base: usize,
}

impl FlowDefinition {
    pub fn component(&self, index: usize) -> Result<&Component> {
        self.components.get(index).ok_or_else(|| {
            MicroflowError::Logic(format!(
                "component index {index} out of range in flow `{}`",
                self.name
            ))
        })
    }

    pub fn component_index(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c.name == name)
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name == name)
    }

    pub fn variable_slot(&self, index: usize) -> usize {
        self.variable_base + index
    }

    pub fn value_slot_count(&self) -> usize {
        self.variable_base + self.variables.len()
    }

    /// Indices of the components seeded into the queue when an instance starts.
    pub fn start_components(&self) -> Vec<usize> {
        self.components
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c.kind, ComponentKind::Start))
            .map(|(index, _)| index)
            .collect()
    }
}

/// 流程变量声明
#[derive(Clone, Debug)]
pub struct VariableDefinition {
    pub name: String,
    pub default: Value,
}

/// 流程中的一个组件 - 类型、静态属性、输入输出边
#[derive(Clone, Debug)]
pub struct Component {
    pub name: String,
    pub kind: ComponentKind,
    /// Value-slot index backing each input of this component.
    pub input_slots: Vec<usize>,
    pub outputs: Vec<OutputEdge>,
}

#[derive(Clone, Debug, Default)]
pub struct OutputEdge {
    pub connections: Vec<Connection>,
}

#[derive(Clone, Copy, Debug)]
pub struct Connection {
    pub target_component: usize,
    pub target_input: usize,
}

/// 组件类型 - 每种类型携带其静态属性表达式
#[derive(Clone, Debug)]
pub enum ComponentKind {
    Start,
    End,
    /// Emits the value the flow instance was created with.
    FlowInput,
    /// Routes this component's input through to the parent call site's output.
    FlowOutput {
        output_index: usize,
    },
    Constant {
        value: Expression,
    },
    SetVariable {
        variable: Expression,
        value: Expression,
    },
    Switch {
        condition: Expression,
    },
    Delay {
        milliseconds: Expression,
    },
    Counter {
        count: Expression,
    },
    Loop {
        variable: Expression,
        from: Expression,
        to: Expression,
        step: Expression,
    },
    TestAndSet {
        variable: Expression,
    },
    WatchVariable {
        expression: Expression,
    },
    CallAction {
        flow: usize,
        input: Option<Expression>,
    },
    Log {
        message: Expression,
    },
}

impl ComponentKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ComponentKind::Start => "start",
            ComponentKind::End => "end",
            ComponentKind::FlowInput => "flow_input",
            ComponentKind::FlowOutput { .. } => "flow_output",
            ComponentKind::Constant { .. } => "constant",
            ComponentKind::SetVariable { .. } => "set_variable",
            ComponentKind::Switch { .. } => "switch",
            ComponentKind::Delay { .. } => "delay",
            ComponentKind::Counter { .. } => "counter",
            ComponentKind::Loop { .. } => "loop",
            ComponentKind::TestAndSet { .. } => "test_and_set",
            ComponentKind::WatchVariable { .. } => "watch_variable",
            ComponentKind::CallAction { .. } => "call_action",
            ComponentKind::Log { .. } => "log",
        }
    }

    /// Minimum number of output edges the executor may address.
    pub(crate) fn min_outputs(&self) -> usize {
        match self {
            ComponentKind::End => 0,
            ComponentKind::Switch { .. }
            | ComponentKind::Counter { .. }
            | ComponentKind::Loop { .. } => 2,
            _ => 1,
        }
    }

    /// Minimum number of input slots; the loop's second input receives the
    /// body's loop-back edge.
    pub(crate) fn min_inputs(&self) -> usize {
        match self {
            ComponentKind::Loop { .. } => 2,
            _ => 1,
        }
    }
}
