// Flow 模块 - 流程定义、构建与资产装载

pub mod builder;
pub mod loader;
pub mod types;

// 重新导出核心类型
pub use builder::FlowBuilder;
pub use loader::{
    load_bundle_from_path, load_bundle_from_str, load_bundle_from_value, BundleConfig,
    ComponentConfig, ConnectionConfig, ExpressionConfig, FlowConfig, VariableConfig,
};
pub use types::{
    Component, ComponentKind, Connection, FlowBundle, FlowDefinition, OutputEdge,
    VariableDefinition, DONE_OUTPUT_INDEX, FALSE_OUTPUT_INDEX, SEQOUT_INDEX,
};
