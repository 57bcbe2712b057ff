use crate::error::{MicroflowError, Result};

use super::states::FlowStateId;

/// 任务队列默认容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// 队列条目 - 指向入队时被 pin 住的 flow state
#[derive(Clone, Copy, Debug)]
pub struct QueueEntry {
    /// `None` marks a tombstone: the owner was torn down after enqueue. The
    /// entry's pin and work accounting were settled at tombstoning time.
    pub flow_state: Option<FlowStateId>,
    pub component_index: usize,
    /// Self-rescheduling polling work; never counts as forward progress.
    pub continuous: bool,
}

/// Pins and work units released by a cancellation; the caller settles them
/// against the owner's refcount and the observer hooks.
#[derive(Clone, Copy, Debug, Default)]
pub struct CancelSummary {
    pub released_pins: usize,
    pub cancelled_work: usize,
}

/// 有界环形任务队列 - 严格 FIFO，无优先级
pub struct TaskQueue {
    entries: Vec<Option<QueueEntry>>,
    head: usize,
    len: usize,
    pending_work: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "task queue capacity must be non-zero");
        Self {
            entries: vec![None; capacity],
            head: 0,
            len: 0,
            pending_work: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Outstanding non-continuous entries.
    pub fn pending_work(&self) -> usize {
        self.pending_work
    }

    pub fn push(&mut self, entry: QueueEntry) -> Result<()> {
        if self.len == self.entries.len() {
            return Err(MicroflowError::QueueExhausted {
                capacity: self.entries.len(),
            });
        }
        let tail = (self.head + self.len) % self.entries.len();
        self.entries[tail] = Some(entry);
        self.len += 1;
        if !entry.continuous {
            self.pending_work += 1;
        }
        Ok(())
    }

    pub fn peek(&self) -> Option<QueueEntry> {
        if self.len == 0 {
            return None;
        }
        Some(self.entries[self.head].expect("occupied queue slot"))
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        if self.len == 0 {
            return None;
        }
        let entry = self.entries[self.head]
            .take()
            .expect("occupied queue slot");
        self.head = (self.head + 1) % self.entries.len();
        self.len -= 1;
        if entry.flow_state.is_some() && !entry.continuous {
            assert!(self.pending_work > 0, "queue work counter underflow");
            self.pending_work -= 1;
        }
        Some(entry)
    }

    pub fn is_queued(&self, flow_state: FlowStateId, component_index: usize) -> bool {
        self.iter_occupied().any(|entry| {
            entry.flow_state == Some(flow_state) && entry.component_index == component_index
        })
    }

    /// Tombstones every entry of a flow state being torn down, in place and
    /// without compacting the ring.
    pub fn cancel(&mut self, flow_state: FlowStateId) -> CancelSummary {
        let mut summary = CancelSummary::default();
        let capacity = self.entries.len();
        for offset in 0..self.len {
            let index = (self.head + offset) % capacity;
            if let Some(entry) = &mut self.entries[index] {
                if entry.flow_state == Some(flow_state) {
                    entry.flow_state = None;
                    summary.released_pins += 1;
                    if !entry.continuous {
                        assert!(self.pending_work > 0, "queue work counter underflow");
                        self.pending_work -= 1;
                        summary.cancelled_work += 1;
                    }
                }
            }
        }
        summary
    }

    /// Engine shutdown path; callers must have released every live pin first.
    pub(crate) fn clear(&mut self) {
        for slot in &mut self.entries {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
        self.pending_work = 0;
    }

    fn iter_occupied(&self) -> impl Iterator<Item = &QueueEntry> + '_ {
        let capacity = self.entries.len();
        (0..self.len).filter_map(move |offset| {
            self.entries[(self.head + offset) % capacity].as_ref()
        })
    }
}
