use std::fmt;

use crate::error::{MicroflowError, Result};
use crate::value::Value;

use super::components::ExecutionState;

/// Flow state 竞技场 - 固定容量、稳定代际句柄

pub const DEFAULT_FLOW_STATE_CAPACITY: usize = 64;

/// Stable handle to an arena slot. A freed slot bumps its generation, so a
/// stale handle simply stops resolving instead of dangling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowStateId {
    index: u32,
    generation: u32,
}

impl FlowStateId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for FlowStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fs{}v{}", self.index, self.generation)
    }
}

/// 嵌套流程回链 - 子流程指回其调用组件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParentLink {
    pub flow_state: FlowStateId,
    pub component_index: usize,
}

/// 一个流程定义的运行实例
pub struct FlowState {
    pub(crate) flow_index: usize,
    /// Value handed over at creation; emitted by `FlowInput` components.
    pub(crate) input_value: Value,
    /// Component input slots first, variables above `variable_base`.
    pub(crate) values: Vec<Value>,
    pub(crate) execution_states: Vec<Option<ExecutionState>>,
    pub(crate) async_flags: Vec<bool>,
    pub(crate) parent: Option<ParentLink>,
    /// Holders across suspension points: queue entries, watch nodes, async
    /// waits, child back-references, the engine's run list.
    pub(crate) ref_count: u32,
    /// How many of those references are watch-list pins.
    pub(crate) watch_pins: u32,
}

struct ArenaSlot {
    generation: u32,
    state: Option<FlowState>,
}

pub struct FlowStateArena {
    slots: Vec<ArenaSlot>,
    free: Vec<usize>,
    live: usize,
}

impl FlowStateArena {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "flow state arena capacity must be non-zero");
        let slots = (0..capacity)
            .map(|_| ArenaSlot {
                generation: 0,
                state: None,
            })
            .collect();
        Self {
            slots,
            free: (0..capacity).rev().collect(),
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn allocate(&mut self, state: FlowState) -> Result<FlowStateId> {
        let index = self.free.pop().ok_or(MicroflowError::ResourceExhausted {
            capacity: self.slots.len(),
        })?;
        let slot = &mut self.slots[index];
        slot.state = Some(state);
        self.live += 1;
        Ok(FlowStateId::new(index as u32, slot.generation))
    }

    fn slot(&self, id: FlowStateId) -> Option<&ArenaSlot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    pub fn contains(&self, id: FlowStateId) -> bool {
        self.slot(id).map(|s| s.state.is_some()).unwrap_or(false)
    }

    pub fn get(&self, id: FlowStateId) -> Option<&FlowState> {
        self.slot(id).and_then(|slot| slot.state.as_ref())
    }

    pub fn get_mut(&mut self, id: FlowStateId) -> Option<&mut FlowState> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.state.as_mut())
    }

    /// Frees the slot and invalidates every outstanding handle to it.
    pub fn remove(&mut self, id: FlowStateId) -> Option<FlowState> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let state = slot.state.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index as usize);
        self.live -= 1;
        Some(state)
    }

    pub fn ids(&self) -> Vec<FlowStateId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state.is_some())
            .map(|(index, slot)| FlowStateId::new(index as u32, slot.generation))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_state() -> FlowState {
        FlowState {
            flow_index: 0,
            input_value: Value::Undefined,
            values: Vec::new(),
            execution_states: Vec::new(),
            async_flags: Vec::new(),
            parent: None,
            ref_count: 1,
            watch_pins: 0,
        }
    }

    #[test]
    fn stale_handle_stops_resolving() {
        let mut arena = FlowStateArena::new(2);
        let id = arena.allocate(blank_state()).unwrap();
        assert!(arena.contains(id));
        arena.remove(id).unwrap();
        assert!(!arena.contains(id));
        // the recycled slot answers to a fresh generation only
        let reused = arena.allocate(blank_state()).unwrap();
        assert!(!arena.contains(id));
        assert!(arena.contains(reused));
    }

    #[test]
    fn exhaustion_is_surfaced() {
        let mut arena = FlowStateArena::new(1);
        arena.allocate(blank_state()).unwrap();
        assert!(matches!(
            arena.allocate(blank_state()),
            Err(MicroflowError::ResourceExhausted { capacity: 1 })
        ));
    }
}
