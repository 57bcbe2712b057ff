use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::error::{MicroflowError, Result};
use crate::eval::{eval_expression, AssignableRef, EvalScope, Expression};
use crate::flow::{FlowBundle, SEQOUT_INDEX};
use crate::value::Value;

use super::clock::{Clock, MonotonicClock};
use super::components::ExecutionState;
use super::debugger::{DebuggerHooks, ErrorLog, FlowErrorRecord};
use super::executor::execute_component;
use super::queue::{QueueEntry, TaskQueue, DEFAULT_QUEUE_CAPACITY};
use super::states::{
    FlowState, FlowStateArena, FlowStateId, ParentLink, DEFAULT_FLOW_STATE_CAPACITY,
};
use super::watch::WatchList;

/// 流程执行引擎
///
/// One engine owns its queue, arena, watch list and clock; nothing is process
/// global, so independent engines (and tests) coexist freely. The host drives
/// it with `tick()` from a single logical thread.
pub struct Engine {
    bundle: Arc<FlowBundle>,
    arena: FlowStateArena,
    queue: TaskQueue,
    watch: WatchList,
    clock: Box<dyn Clock>,
    hooks: Option<Box<dyn DebuggerHooks>>,
    errors: ErrorLog,
    /// Top-level instances whose run pin the engine holds until an End
    /// component finishes them.
    running: Vec<FlowStateId>,
}

impl Engine {
    pub fn new(bundle: FlowBundle) -> Self {
        Self {
            bundle: Arc::new(bundle),
            arena: FlowStateArena::new(DEFAULT_FLOW_STATE_CAPACITY),
            queue: TaskQueue::new(DEFAULT_QUEUE_CAPACITY),
            watch: WatchList::new(),
            clock: Box::new(MonotonicClock::new()),
            hooks: None,
            errors: ErrorLog::default(),
            running: Vec::new(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue = TaskQueue::new(capacity);
        self
    }

    pub fn with_state_capacity(mut self, capacity: usize) -> Self {
        self.arena = FlowStateArena::new(capacity);
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hooks(mut self, hooks: Box<dyn DebuggerHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn bundle(&self) -> &FlowBundle {
        &self.bundle
    }

    /// Cloneable handle onto the bounded error log.
    pub fn error_log(&self) -> ErrorLog {
        self.errors.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Outstanding non-continuous tasks.
    pub fn pending_work(&self) -> usize {
        self.queue.pending_work()
    }

    pub fn live_flow_states(&self) -> usize {
        self.arena.live()
    }

    pub fn watch_len(&self) -> usize {
        self.watch.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.arena.live() == 0
    }

    // ---------------------------------------------------------------- host

    pub fn start_flow(&mut self, flow_index: usize, input: Value) -> Result<FlowStateId> {
        let id = self.create_flow_state(flow_index, None, input)?;
        self.running.push(id);
        self.seed_flow(id)?;
        Ok(id)
    }

    pub fn start_flow_by_name(&mut self, name: &str, input: Value) -> Result<FlowStateId> {
        let flow_index = self
            .bundle
            .flow_index(name)
            .ok_or_else(|| MicroflowError::UnknownFlow(name.to_string()))?;
        self.start_flow(flow_index, input)
    }

    /// One scheduling quantum: a single pass over the tasks present at entry
    /// (continuous re-enqueues therefore run next tick), then one visit of the
    /// watch list.
    pub fn tick(&mut self) {
        let budget = self.queue.len();
        for _ in 0..budget {
            let Some(entry) = self.queue.peek() else { break };
            match entry.flow_state {
                // tombstone: pin and work accounting were settled at cancel
                None => {
                    self.queue.pop();
                }
                Some(id) => {
                    // the entry stays at the head during execution; its pin
                    // doubles as the dispatch pin
                    execute_component(self, id, entry.component_index);
                    let popped = self.queue.pop().expect("executed entry still queued");
                    if !popped.continuous {
                        if let Some(h) = self.hooks.as_deref_mut() {
                            h.on_remove_from_queue();
                        }
                    }
                    self.dec_ref(id);
                }
            }
        }
        self.visit_watch_list();
    }

    /// Tears down every live flow instance and empties the queue.
    pub fn stop(&mut self) {
        let running = std::mem::take(&mut self.running);
        for id in running {
            if self.arena.contains(id) {
                self.terminate_flow_state(id);
                self.dec_ref(id);
            }
        }
        for id in self.arena.ids() {
            warn!(flow_state = %id, "flow state survived shutdown teardown");
            self.terminate_flow_state(id);
            if self.arena.contains(id) {
                // orphaned creation pin
                self.dec_ref(id);
            }
        }
        self.queue.clear();
    }

    pub fn set_variable(&mut self, id: FlowStateId, name: &str, value: Value) -> Result<()> {
        let bundle = Arc::clone(&self.bundle);
        let state = self
            .arena
            .get(id)
            .ok_or_else(|| MicroflowError::Logic(format!("flow state {id} is gone")))?;
        let definition = bundle.flow(state.flow_index)?;
        let variable = definition
            .variable_index(name)
            .ok_or_else(|| MicroflowError::UnknownVariable(name.to_string()))?;
        self.write_value_slot(id, definition.variable_slot(variable), value);
        Ok(())
    }

    pub fn get_variable(&self, id: FlowStateId, name: &str) -> Result<Value> {
        let state = self
            .arena
            .get(id)
            .ok_or_else(|| MicroflowError::Logic(format!("flow state {id} is gone")))?;
        let definition = self.bundle.flow(state.flow_index)?;
        let variable = definition
            .variable_index(name)
            .ok_or_else(|| MicroflowError::UnknownVariable(name.to_string()))?;
        Ok(state.values[definition.variable_slot(variable)].clone())
    }

    // ------------------------------------------------------- lifecycle

    pub(crate) fn create_flow_state(
        &mut self,
        flow_index: usize,
        parent: Option<ParentLink>,
        input: Value,
    ) -> Result<FlowStateId> {
        let bundle = Arc::clone(&self.bundle);
        let definition = bundle.flow(flow_index)?;
        let mut values = vec![Value::Undefined; definition.value_slot_count()];
        for (index, variable) in definition.variables.iter().enumerate() {
            values[definition.variable_slot(index)] = variable.default.clone();
        }
        let component_count = definition.components.len();
        let id = self.arena.allocate(FlowState {
            flow_index,
            input_value: input,
            values,
            execution_states: (0..component_count).map(|_| None).collect(),
            async_flags: vec![false; component_count],
            parent,
            ref_count: 1,
            watch_pins: 0,
        })?;
        if let Some(link) = parent {
            // the child's back-reference pins the parent
            self.inc_ref(link.flow_state);
        }
        trace!(flow_state = %id, flow = %definition.name, "flow state created");
        if let Some(h) = self.hooks.as_deref_mut() {
            h.on_flow_state_created(id);
        }
        Ok(id)
    }

    /// Queues every Start component of a freshly created instance.
    pub(crate) fn seed_flow(&mut self, id: FlowStateId) -> Result<()> {
        let bundle = Arc::clone(&self.bundle);
        let flow_index = self
            .flow_index_of(id)
            .ok_or_else(|| MicroflowError::Logic(format!("flow state {id} is gone")))?;
        for component_index in bundle.flow(flow_index)?.start_components() {
            self.enqueue_task(id, component_index, None, 0, false)?;
        }
        Ok(())
    }

    pub(crate) fn inc_ref(&mut self, id: FlowStateId) {
        let state = self
            .arena
            .get_mut(id)
            .expect("inc_ref against a freed flow state");
        state.ref_count += 1;
    }

    pub(crate) fn dec_ref(&mut self, id: FlowStateId) {
        let free = {
            let state = self
                .arena
                .get_mut(id)
                .expect("dec_ref against a freed flow state");
            assert!(state.ref_count > 0, "flow state refcount underflow");
            state.ref_count -= 1;
            state.ref_count == 0
        };
        if free {
            self.destroy_flow_state(id);
        }
    }

    /// Runs exactly once per instance, as soon as the last reference drops.
    fn destroy_flow_state(&mut self, id: FlowStateId) {
        let Some(mut state) = self.arena.remove(id) else {
            return;
        };
        debug_assert_eq!(state.ref_count, 0);
        debug_assert_eq!(state.watch_pins, 0);
        for (component_index, slot) in state.execution_states.iter_mut().enumerate() {
            if let Some(exec) = slot.take() {
                self.teardown_execution_state(id, component_index, exec);
            }
        }
        if let Some(link) = state.parent {
            if self.arena.contains(link.flow_state) {
                self.dec_ref(link.flow_state);
            }
        }
        self.running.retain(|&running| running != id);
        trace!(flow_state = %id, "flow state destroyed");
        if let Some(h) = self.hooks.as_deref_mut() {
            h.on_flow_state_destroyed(id);
        }
    }

    fn teardown_execution_state(
        &mut self,
        id: FlowStateId,
        component_index: usize,
        exec: ExecutionState,
    ) {
        match exec {
            ExecutionState::CallAction(call) => {
                // a live child would still pin this state, so normally the
                // slot was already cleared by the child's End
                if self.arena.contains(call.child) {
                    self.terminate_flow_state(call.child);
                    if self.arena.contains(call.child) {
                        self.dec_ref(call.child);
                    }
                }
            }
            ExecutionState::Watch(_) => {
                // its node, if still linked, would pin this state; a leftover
                // here is stale slab data, not a live pin
                self.watch.remove_for(id, component_index);
            }
            _ => {}
        }
    }

    /// Forced teardown: detach children, cancel queued tasks, unlink watch
    /// nodes and drop async waits so the refcount can fall naturally.
    pub(crate) fn terminate_flow_state(&mut self, id: FlowStateId) {
        // detach child flows first; each releases its back-reference on us
        let children: Vec<(usize, FlowStateId)> = match self.arena.get_mut(id) {
            None => return,
            Some(state) => state
                .execution_states
                .iter_mut()
                .enumerate()
                .filter_map(|(index, slot)| match slot.take() {
                    Some(ExecutionState::CallAction(call)) => Some((index, call.child)),
                    other => {
                        *slot = other;
                        None
                    }
                })
                .collect(),
        };
        for (component_index, child) in children {
            if self.arena.contains(child) {
                self.terminate_flow_state(child);
                if self.arena.contains(child) {
                    self.dec_ref(child);
                }
            }
            self.end_async_execution(id, component_index);
        }
        if !self.arena.contains(id) {
            return;
        }
        self.cancel_flow_state_tasks(id);
        if self.arena.contains(id) {
            self.unlink_watches(id);
        }
        if self.arena.contains(id) {
            self.clear_async_pins(id);
        }
    }

    pub(crate) fn cancel_flow_state_tasks(&mut self, id: FlowStateId) {
        let summary = self.queue.cancel(id);
        for _ in 0..summary.cancelled_work {
            if let Some(h) = self.hooks.as_deref_mut() {
                h.on_remove_from_queue();
            }
        }
        for _ in 0..summary.released_pins {
            self.dec_ref(id);
        }
    }

    pub(crate) fn unlink_watches(&mut self, id: FlowStateId) {
        let removed = self.watch.unlink_all(id);
        if removed == 0 {
            return;
        }
        if let Some(state) = self.arena.get_mut(id) {
            debug_assert!(state.watch_pins as usize >= removed);
            state.watch_pins -= removed as u32;
        }
        for _ in 0..removed {
            self.dec_ref(id);
        }
    }

    fn clear_async_pins(&mut self, id: FlowStateId) {
        let pending: Vec<usize> = match self.arena.get(id) {
            None => return,
            Some(state) => state
                .async_flags
                .iter()
                .enumerate()
                .filter(|(_, &set)| set)
                .map(|(index, _)| index)
                .collect(),
        };
        for component_index in pending {
            self.end_async_execution(id, component_index);
        }
    }

    /// Releases the engine's run pin once a top-level flow reaches its End.
    pub(crate) fn finish_flow(&mut self, id: FlowStateId) {
        if let Some(position) = self.running.iter().position(|&running| running == id) {
            self.running.remove(position);
            debug!(flow_state = %id, "flow finished");
            self.dec_ref(id);
        }
    }

    // ------------------------------------------------------ watch pass

    fn visit_watch_list(&mut self) {
        for (id, component_index) in self.watch.entries() {
            let Some(state) = self.arena.get(id) else {
                // a linked node always pins its owner; reaching here means the
                // accounting broke somewhere upstream
                warn!(flow_state = %id, "watch node references a freed flow state");
                self.watch.remove_for(id, component_index);
                continue;
            };
            if state.ref_count == state.watch_pins {
                // nothing but the watch list needs this state any more; drop
                // our own pins, which frees it
                self.unlink_watches(id);
                continue;
            }
            execute_component(self, id, component_index);
        }
    }

    // ------------------------------------------- component primitives

    /// Appends a task, pinning its flow state for the lifetime of the entry.
    pub(crate) fn enqueue_task(
        &mut self,
        id: FlowStateId,
        component_index: usize,
        source: Option<(usize, usize)>,
        target_input: usize,
        continuous: bool,
    ) -> Result<()> {
        if !self.arena.contains(id) {
            return Err(MicroflowError::Logic(format!(
                "enqueue against freed flow state {id}"
            )));
        }
        self.queue.push(QueueEntry {
            flow_state: Some(id),
            component_index,
            continuous,
        })?;
        self.inc_ref(id);
        if !continuous {
            if let Some(h) = self.hooks.as_deref_mut() {
                h.on_add_to_queue(id, source, component_index, target_input);
            }
        }
        Ok(())
    }

    /// The continuous-task idiom: a component re-arms itself to be polled
    /// again next tick.
    pub(crate) fn enqueue_continuous(&mut self, id: FlowStateId, component_index: usize) {
        if let Err(err) = self.enqueue_task(id, component_index, None, 0, true) {
            self.throw_error(id, component_index, &err.to_string());
        }
    }

    /// Writes a value to a data output and queues every connected component.
    /// Failures (bad output index, full queue) are reported and drop only
    /// this propagation.
    pub(crate) fn propagate_value(
        &mut self,
        id: FlowStateId,
        component_index: usize,
        output_index: usize,
        value: Value,
    ) {
        let bundle = Arc::clone(&self.bundle);
        let Some(flow_index) = self.flow_index_of(id) else {
            return;
        };
        let definition = match bundle.flow(flow_index) {
            Ok(definition) => definition,
            Err(err) => {
                self.throw_error(id, component_index, &err.to_string());
                return;
            }
        };
        let component = match definition.component(component_index) {
            Ok(component) => component,
            Err(err) => {
                self.throw_error(id, component_index, &err.to_string());
                return;
            }
        };
        let Some(edge) = component.outputs.get(output_index) else {
            self.throw_error(
                id,
                component_index,
                &format!(
                    "output {output_index} out of range on `{}`",
                    component.name
                ),
            );
            return;
        };
        for connection in &edge.connections {
            let target = match definition.component(connection.target_component) {
                Ok(target) => target,
                Err(err) => {
                    self.throw_error(id, component_index, &err.to_string());
                    continue;
                }
            };
            let Some(&slot) = target.input_slots.get(connection.target_input) else {
                self.throw_error(
                    id,
                    component_index,
                    &format!("input {} out of range on `{}`", connection.target_input, target.name),
                );
                continue;
            };
            if let Some(state) = self.arena.get_mut(id) {
                state.values[slot] = value.clone();
            }
            if let Err(err) = self.enqueue_task(
                id,
                connection.target_component,
                Some((component_index, output_index)),
                connection.target_input,
                false,
            ) {
                self.throw_error(id, component_index, &err.to_string());
            }
        }
    }

    /// Follows the unconditional sequence edge.
    pub(crate) fn propagate_through_seqout(&mut self, id: FlowStateId, component_index: usize) {
        self.propagate_value(id, component_index, SEQOUT_INDEX, Value::Null);
    }

    /// Reports a component-local failure and abandons the current execution
    /// path. The scheduler and all other in-flight flows are unaffected.
    pub(crate) fn throw_error(&mut self, id: FlowStateId, component_index: usize, message: &str) {
        error!(flow_state = %id, component = component_index, "{message}");
        self.errors.push(FlowErrorRecord {
            flow_state: id,
            component_index,
            message: message.to_string(),
        });
        if let Some(h) = self.hooks.as_deref_mut() {
            h.on_flow_error(id, component_index, message);
        }
    }

    /// Suppresses default completion for a component awaiting an out-of-band
    /// event; the pending resolution owns a reference until it fires.
    pub(crate) fn begin_async_execution(&mut self, id: FlowStateId, component_index: usize) {
        let armed = match self.arena.get_mut(id) {
            Some(state) if !state.async_flags[component_index] => {
                state.async_flags[component_index] = true;
                state.ref_count += 1;
                true
            }
            _ => false,
        };
        if armed {
            if let Some(h) = self.hooks.as_deref_mut() {
                h.on_component_async_state_changed(id, component_index);
            }
        }
    }

    pub(crate) fn end_async_execution(&mut self, id: FlowStateId, component_index: usize) {
        let disarmed = match self.arena.get_mut(id) {
            Some(state) if state.async_flags[component_index] => {
                state.async_flags[component_index] = false;
                true
            }
            _ => false,
        };
        if disarmed {
            if let Some(h) = self.hooks.as_deref_mut() {
                h.on_component_async_state_changed(id, component_index);
            }
            self.dec_ref(id);
        }
    }

    // ------------------------------------------------- state accessors

    pub(crate) fn bundle_arc(&self) -> Arc<FlowBundle> {
        Arc::clone(&self.bundle)
    }

    pub(crate) fn flow_index_of(&self, id: FlowStateId) -> Option<usize> {
        self.arena.get(id).map(|state| state.flow_index)
    }

    pub(crate) fn parent_of(&self, id: FlowStateId) -> Option<ParentLink> {
        self.arena.get(id).and_then(|state| state.parent)
    }

    pub(crate) fn flow_input_value(&self, id: FlowStateId) -> Value {
        self.arena
            .get(id)
            .map(|state| state.input_value.clone())
            .unwrap_or_default()
    }

    pub(crate) fn exec_state(
        &self,
        id: FlowStateId,
        component_index: usize,
    ) -> Option<&ExecutionState> {
        self.arena
            .get(id)
            .and_then(|state| state.execution_states[component_index].as_ref())
    }

    pub(crate) fn exec_state_mut(
        &mut self,
        id: FlowStateId,
        component_index: usize,
    ) -> Option<&mut ExecutionState> {
        self.arena
            .get_mut(id)
            .and_then(|state| state.execution_states[component_index].as_mut())
    }

    pub(crate) fn set_execution_state(
        &mut self,
        id: FlowStateId,
        component_index: usize,
        exec: Option<ExecutionState>,
    ) {
        let changed = match self.arena.get_mut(id) {
            Some(state) => {
                state.execution_states[component_index] = exec;
                true
            }
            None => false,
        };
        if changed {
            if let Some(h) = self.hooks.as_deref_mut() {
                h.on_component_execution_state_changed(id, component_index);
            }
        }
    }

    /// Takes a CallAction slot when the child's End routes completion back.
    pub(crate) fn take_call_state(
        &mut self,
        id: FlowStateId,
        component_index: usize,
    ) -> Option<super::components::CallActionState> {
        let taken = self.arena.get_mut(id).and_then(|state| {
            match state.execution_states[component_index].take() {
                Some(ExecutionState::CallAction(call)) => Some(call),
                other => {
                    state.execution_states[component_index] = other;
                    None
                }
            }
        });
        if taken.is_some() {
            if let Some(h) = self.hooks.as_deref_mut() {
                h.on_component_execution_state_changed(id, component_index);
            }
        }
        taken
    }

    pub(crate) fn add_watch(&mut self, id: FlowStateId, component_index: usize) {
        self.watch.add(id, component_index);
        if let Some(state) = self.arena.get_mut(id) {
            state.watch_pins += 1;
            state.ref_count += 1;
        }
    }

    /// Linear probe for already-pending work on a component, for call sites
    /// that coalesce duplicate propagation.
    pub fn is_queued(&self, id: FlowStateId, component_index: usize) -> bool {
        self.queue.is_queued(id, component_index)
    }

    pub(crate) fn clock_millis(&self) -> u64 {
        self.clock.millis()
    }

    /// Evaluates an expression in a component's scope (its input slots and
    /// the flow's variables).
    pub(crate) fn eval_in_component(
        &self,
        id: FlowStateId,
        component_index: usize,
        expression: &Expression,
    ) -> Result<Value> {
        let state = self
            .arena
            .get(id)
            .ok_or_else(|| MicroflowError::Logic(format!("flow state {id} is gone")))?;
        let definition = self.bundle.flow(state.flow_index)?;
        let component = definition.component(component_index)?;
        let scope = EvalScope {
            values: &state.values,
            input_slots: &component.input_slots,
            variable_base: definition.variable_base,
        };
        eval_expression(expression, &scope)
    }

    pub(crate) fn input_value(
        &self,
        id: FlowStateId,
        component_index: usize,
        input: usize,
    ) -> Value {
        let Some(state) = self.arena.get(id) else {
            return Value::Undefined;
        };
        let Ok(definition) = self.bundle.flow(state.flow_index) else {
            return Value::Undefined;
        };
        let Ok(component) = definition.component(component_index) else {
            return Value::Undefined;
        };
        component
            .input_slots
            .get(input)
            .and_then(|&slot| state.values.get(slot))
            .cloned()
            .unwrap_or_default()
    }

    fn assignable_slot(&self, id: FlowStateId, target: AssignableRef) -> Result<usize> {
        let state = self
            .arena
            .get(id)
            .ok_or_else(|| MicroflowError::Logic(format!("flow state {id} is gone")))?;
        let definition = self.bundle.flow(state.flow_index)?;
        let AssignableRef::Variable(index) = target;
        if index >= definition.variables.len() {
            return Err(MicroflowError::Logic(format!(
                "variable index {index} out of range in flow `{}`",
                definition.name
            )));
        }
        Ok(definition.variable_slot(index))
    }

    pub(crate) fn read_assignable(&self, id: FlowStateId, target: AssignableRef) -> Result<Value> {
        let slot = self.assignable_slot(id, target)?;
        Ok(self
            .arena
            .get(id)
            .and_then(|state| state.values.get(slot))
            .cloned()
            .unwrap_or_default())
    }

    pub(crate) fn write_assignable(
        &mut self,
        id: FlowStateId,
        target: AssignableRef,
        value: Value,
    ) -> Result<()> {
        let slot = self.assignable_slot(id, target)?;
        self.write_value_slot(id, slot, value);
        Ok(())
    }

    pub(crate) fn write_value_slot(&mut self, id: FlowStateId, slot: usize, value: Value) {
        if let Some(state) = self.arena.get_mut(id) {
            state.values[slot] = value.clone();
        }
        if let Some(h) = self.hooks.as_deref_mut() {
            h.on_value_changed(id, slot, &value);
        }
    }
}
