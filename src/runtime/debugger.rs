use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::value::Value;

use super::states::FlowStateId;

/// 调试器回调 - 纯旁观者，接不接线不得改变引擎行为
///
/// Every method has an empty default body; an implementation overrides only
/// what it wants to observe.
pub trait DebuggerHooks: Send {
    /// A non-continuous task entered the queue, with its causal edge
    /// `(source_component, source_output)` when one exists.
    fn on_add_to_queue(
        &mut self,
        _flow_state: FlowStateId,
        _source: Option<(usize, usize)>,
        _target_component: usize,
        _target_input: usize,
    ) {
    }

    fn on_remove_from_queue(&mut self) {}

    fn on_flow_state_created(&mut self, _flow_state: FlowStateId) {}

    fn on_flow_state_destroyed(&mut self, _flow_state: FlowStateId) {}

    fn on_value_changed(&mut self, _flow_state: FlowStateId, _value_slot: usize, _value: &Value) {}

    fn on_flow_error(&mut self, _flow_state: FlowStateId, _component_index: usize, _message: &str) {
    }

    fn on_component_execution_state_changed(
        &mut self,
        _flow_state: FlowStateId,
        _component_index: usize,
    ) {
    }

    fn on_component_async_state_changed(
        &mut self,
        _flow_state: FlowStateId,
        _component_index: usize,
    ) {
    }
}

/// 错误环形日志容量
pub const ERROR_LOG_CAPACITY: usize = 32;

#[derive(Clone, Debug)]
pub struct FlowErrorRecord {
    pub flow_state: FlowStateId,
    pub component_index: usize,
    pub message: String,
}

/// 有界错误日志 - 宿主持有句柄即可随时读取
#[derive(Clone, Default)]
pub struct ErrorLog {
    inner: Arc<Mutex<VecDeque<FlowErrorRecord>>>,
}

impl ErrorLog {
    pub fn push(&self, record: FlowErrorRecord) {
        let mut log = self.inner.lock();
        if log.len() == ERROR_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(record);
    }

    pub fn recent(&self) -> Vec<FlowErrorRecord> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_log_drops_oldest() {
        let log = ErrorLog::default();
        for i in 0..ERROR_LOG_CAPACITY + 3 {
            log.push(FlowErrorRecord {
                flow_state: FlowStateId::new(0, 0),
                component_index: i,
                message: format!("error {i}"),
            });
        }
        let recent = log.recent();
        assert_eq!(recent.len(), ERROR_LOG_CAPACITY);
        assert_eq!(recent.first().unwrap().component_index, 3);
    }
}
