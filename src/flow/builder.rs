use std::collections::HashMap;

use crate::error::{MicroflowError, Result};
use crate::eval::Expression;
use crate::value::Value;

use super::types::{
    Component, ComponentKind, Connection, FlowDefinition, OutputEdge, VariableDefinition,
};

/// Flow 构建器 - 供测试与内嵌宿主以编程方式组装流程定义
pub struct FlowBuilder {
    name: String,
    components: Vec<(String, ComponentKind)>,
    index_by_name: HashMap<String, usize>,
    connections: Vec<PendingConnection>,
    variables: Vec<VariableDefinition>,
}

struct PendingConnection {
    from: String,
    output: usize,
    to: String,
    input: usize,
}

impl FlowBuilder {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
            index_by_name: HashMap::new(),
            connections: Vec::new(),
            variables: Vec::new(),
        }
    }

    pub fn add_component(&mut self, name: &str, kind: ComponentKind) -> &mut Self {
        match self.index_by_name.get(name) {
            Some(&index) => self.components[index].1 = kind,
            None => {
                self.index_by_name
                    .insert(name.to_string(), self.components.len());
                self.components.push((name.to_string(), kind));
            }
        }
        self
    }

    pub fn declare_variable(&mut self, name: &str, default: impl Into<Value>) -> &mut Self {
        self.variables.push(VariableDefinition {
            name: name.to_string(),
            default: default.into(),
        });
        self
    }

    /// Expression loading a declared variable; also usable as an assignment
    /// target.
    pub fn variable_ref(&self, name: &str) -> Result<Expression> {
        let index = self
            .variables
            .iter()
            .position(|v| v.name == name)
            .ok_or_else(|| MicroflowError::UnknownVariable(name.to_string()))?;
        Ok(Expression::variable(index))
    }

    pub fn connect(&mut self, from: &str, output: usize, to: &str, input: usize) -> &mut Self {
        self.connections.push(PendingConnection {
            from: from.to_string(),
            output,
            to: to.to_string(),
            input,
        });
        self
    }

    pub fn connect_seqout(&mut self, from: &str, to: &str) -> &mut Self {
        self.connect(from, super::types::SEQOUT_INDEX, to, 0)
    }

    pub fn build(self) -> Result<FlowDefinition> {
        let mut input_counts: Vec<usize> = self
            .components
            .iter()
            .map(|(_, kind)| kind.min_inputs())
            .collect();
        let mut output_counts: Vec<usize> = self
            .components
            .iter()
            .map(|(_, kind)| kind.min_outputs())
            .collect();

        let mut resolved = Vec::with_capacity(self.connections.len());
        for pending in &self.connections {
            let from = *self
                .index_by_name
                .get(&pending.from)
                .ok_or_else(|| MicroflowError::UnknownComponent(pending.from.clone()))?;
            let to = *self
                .index_by_name
                .get(&pending.to)
                .ok_or_else(|| MicroflowError::UnknownComponent(pending.to.clone()))?;
            input_counts[to] = input_counts[to].max(pending.input + 1);
            output_counts[from] = output_counts[from].max(pending.output + 1);
            resolved.push((from, pending.output, to, pending.input));
        }

        // Hand each component a contiguous run of value slots for its inputs;
        // variables occupy the slots above all inputs.
        let mut next_slot = 0usize;
        let mut components: Vec<Component> = self
            .components
            .into_iter()
            .zip(input_counts.iter().zip(&output_counts))
            .map(|((name, kind), (&inputs, &outputs))| {
                let input_slots: Vec<usize> = (next_slot..next_slot + inputs).collect();
                next_slot += inputs;
                Component {
                    name,
                    kind,
                    input_slots,
                    outputs: vec![OutputEdge::default(); outputs],
                }
            })
            .collect();

        for (from, output, to, input) in resolved {
            components[from].outputs[output].connections.push(Connection {
                target_component: to,
                target_input: input,
            });
        }

        Ok(FlowDefinition {
            name: self.name,
            components,
            variables: self.variables,
            variable_base: next_slot,
        })
    }
}
