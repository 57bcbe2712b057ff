use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{MicroflowError, Result};
use crate::eval::{BinaryOp, Expression, UnaryOp};
use crate::value::Value;

use super::builder::FlowBuilder;
use super::types::{ComponentKind, FlowBundle, FlowDefinition};

/// Flow 资产加载器 - 解析离线编译器输出的 JSON 包
///
/// Names in the document (variables, components, flows) are resolved to the
/// integer indices the runtime addresses; resolution failures surface as
/// asset errors before any flow state exists.

#[derive(Debug, Deserialize)]
pub struct BundleConfig {
    pub flows: Vec<FlowConfig>,
}

#[derive(Debug, Deserialize)]
pub struct FlowConfig {
    pub name: String,
    #[serde(default)]
    pub variables: Vec<VariableConfig>,
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
}

#[derive(Debug, Deserialize)]
pub struct VariableConfig {
    pub name: String,
    #[serde(default)]
    pub default: JsonValue,
}

#[derive(Debug, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: HashMap<String, ExpressionConfig>,
    /// Target flow name for `call_action` components.
    #[serde(default)]
    pub flow: Option<String>,
    /// Parent output index for `flow_output` components.
    #[serde(default)]
    pub output_index: Option<usize>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub output: usize,
    pub to: String,
    #[serde(default)]
    pub input: usize,
}

/// 表达式配置 - 资产中的表达式树，装载时编译为指令序列
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionConfig {
    Literal(JsonValue),
    Variable(String),
    Input(usize),
    Binary {
        op: String,
        left: Box<ExpressionConfig>,
        right: Box<ExpressionConfig>,
    },
    Unary {
        op: String,
        operand: Box<ExpressionConfig>,
    },
    Call {
        function: String,
        args: Vec<ExpressionConfig>,
    },
}

impl ExpressionConfig {
    fn compile(&self, variables: &HashMap<String, usize>) -> Result<Expression> {
        Ok(match self {
            ExpressionConfig::Literal(json) => Expression::literal(Value::from_json(json)),
            ExpressionConfig::Variable(name) => {
                let index = *variables
                    .get(name)
                    .ok_or_else(|| MicroflowError::UnknownVariable(name.clone()))?;
                Expression::variable(index)
            }
            ExpressionConfig::Input(index) => Expression::input(*index),
            ExpressionConfig::Binary { op, left, right } => {
                let op = BinaryOp::parse(op).ok_or_else(|| {
                    MicroflowError::Asset(format!("unknown binary operator `{op}`"))
                })?;
                Expression::binary(op, left.compile(variables)?, right.compile(variables)?)
            }
            ExpressionConfig::Unary { op, operand } => {
                let op = UnaryOp::parse(op).ok_or_else(|| {
                    MicroflowError::Asset(format!("unknown unary operator `{op}`"))
                })?;
                Expression::unary(op, operand.compile(variables)?)
            }
            ExpressionConfig::Call { function, args } => {
                let args = args
                    .iter()
                    .map(|arg| arg.compile(variables))
                    .collect::<Result<Vec<_>>>()?;
                Expression::call(function.clone(), args)
            }
        })
    }
}

pub fn load_bundle_from_str(text: &str) -> Result<FlowBundle> {
    let config: BundleConfig =
        serde_json::from_str(text).map_err(|e| MicroflowError::Asset(e.to_string()))?;
    build_bundle(config)
}

pub fn load_bundle_from_value(value: JsonValue) -> Result<FlowBundle> {
    let config: BundleConfig =
        serde_json::from_value(value).map_err(|e| MicroflowError::Asset(e.to_string()))?;
    build_bundle(config)
}

pub fn load_bundle_from_path(path: &Path) -> Result<FlowBundle> {
    let text = fs::read_to_string(path)
        .map_err(|e| MicroflowError::Asset(format!("{}: {e}", path.display())))?;
    load_bundle_from_str(&text)
}

fn build_bundle(config: BundleConfig) -> Result<FlowBundle> {
    let flow_indices: HashMap<String, usize> = config
        .flows
        .iter()
        .enumerate()
        .map(|(index, flow)| (flow.name.clone(), index))
        .collect();

    let mut flows = Vec::with_capacity(config.flows.len());
    for flow_config in config.flows {
        flows.push(build_flow(flow_config, &flow_indices)?);
    }
    Ok(FlowBundle::new(flows))
}

fn build_flow(
    config: FlowConfig,
    flow_indices: &HashMap<String, usize>,
) -> Result<FlowDefinition> {
    let mut builder = FlowBuilder::new(&config.name);

    let mut variables = HashMap::new();
    for (index, variable) in config.variables.iter().enumerate() {
        builder.declare_variable(&variable.name, Value::from_json(&variable.default));
        variables.insert(variable.name.clone(), index);
    }

    for component in &config.components {
        let kind = component_kind(component, &variables, flow_indices)?;
        builder.add_component(&component.name, kind);
    }
    for component in &config.components {
        for connection in &component.connections {
            builder.connect(
                &component.name,
                connection.output,
                &connection.to,
                connection.input,
            );
        }
    }

    builder.build()
}

fn component_kind(
    config: &ComponentConfig,
    variables: &HashMap<String, usize>,
    flow_indices: &HashMap<String, usize>,
) -> Result<ComponentKind> {
    let property = |name: &str| -> Result<Expression> {
        config
            .properties
            .get(name)
            .ok_or_else(|| {
                MicroflowError::Asset(format!(
                    "component `{}` is missing property `{name}`",
                    config.name
                ))
            })?
            .compile(variables)
    };
    let optional = |name: &str| -> Result<Option<Expression>> {
        config
            .properties
            .get(name)
            .map(|expr| expr.compile(variables))
            .transpose()
    };

    Ok(match config.kind.as_str() {
        "start" => ComponentKind::Start,
        "end" => ComponentKind::End,
        "flow_input" => ComponentKind::FlowInput,
        "flow_output" => ComponentKind::FlowOutput {
            output_index: config.output_index.unwrap_or(1),
        },
        "constant" => ComponentKind::Constant {
            value: property("value")?,
        },
        "set_variable" => ComponentKind::SetVariable {
            variable: property("variable")?,
            value: property("value")?,
        },
        "switch" => ComponentKind::Switch {
            condition: property("condition")?,
        },
        "delay" => ComponentKind::Delay {
            milliseconds: property("milliseconds")?,
        },
        "counter" => ComponentKind::Counter {
            count: property("count")?,
        },
        "loop" => ComponentKind::Loop {
            variable: property("variable")?,
            from: property("from")?,
            to: property("to")?,
            step: optional("step")?.unwrap_or_else(|| Expression::literal(1i64)),
        },
        "test_and_set" => ComponentKind::TestAndSet {
            variable: property("variable")?,
        },
        "watch_variable" => ComponentKind::WatchVariable {
            expression: property("expression")?,
        },
        "call_action" => {
            let flow_name = config.flow.as_deref().ok_or_else(|| {
                MicroflowError::Asset(format!(
                    "call_action component `{}` is missing its target flow",
                    config.name
                ))
            })?;
            let flow = *flow_indices
                .get(flow_name)
                .ok_or_else(|| MicroflowError::UnknownFlow(flow_name.to_string()))?;
            ComponentKind::CallAction {
                flow,
                input: optional("input")?,
            }
        }
        "log" => ComponentKind::Log {
            message: property("message")?,
        },
        other => {
            return Err(MicroflowError::Asset(format!(
                "unknown component type `{other}`"
            )))
        }
    })
}
