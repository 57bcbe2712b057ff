pub mod error;
pub mod eval;
pub mod flow;
pub mod runtime;
pub mod utils;
pub mod value;

pub use error::{MicroflowError, Result};
pub use eval::{
    eval_assignable_expression, eval_expression, AssignableRef, BinaryOp, EvalScope, Expression,
    Instruction, UnaryOp, EVAL_STACK_DEPTH,
};
pub use flow::{
    load_bundle_from_path, load_bundle_from_str, load_bundle_from_value, Component, ComponentKind,
    Connection, FlowBuilder, FlowBundle, FlowDefinition, OutputEdge, VariableDefinition,
    DONE_OUTPUT_INDEX, FALSE_OUTPUT_INDEX, SEQOUT_INDEX,
};
pub use runtime::{
    Clock, DebuggerHooks, Engine, ErrorLog, FlowErrorRecord, FlowStateId, ManualClock,
    MonotonicClock, ParentLink, DEFAULT_FLOW_STATE_CAPACITY, DEFAULT_QUEUE_CAPACITY,
    ERROR_LOG_CAPACITY,
};
pub use utils::logging;
pub use value::Value;
