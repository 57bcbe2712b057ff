// 运行时执行引擎模块

mod clock;
mod components;
mod debugger;
mod engine;
mod executor;
mod queue;
mod states;
mod watch;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use components::{
    CallActionState, CounterState, DelayState, ExecutionState, LoopState, WatchState,
};
pub use debugger::{DebuggerHooks, ErrorLog, FlowErrorRecord, ERROR_LOG_CAPACITY};
pub use engine::Engine;
pub use queue::{CancelSummary, QueueEntry, TaskQueue, DEFAULT_QUEUE_CAPACITY};
pub use states::{FlowStateId, ParentLink, DEFAULT_FLOW_STATE_CAPACITY};
