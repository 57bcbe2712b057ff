use tracing::info;

use crate::error::{MicroflowError, Result};
use crate::eval::{eval_assignable_expression, AssignableRef, Expression};
use crate::flow::{ComponentKind, DONE_OUTPUT_INDEX, FALSE_OUTPUT_INDEX, SEQOUT_INDEX};
use crate::value::Value;

use super::engine::Engine;
use super::states::{FlowStateId, ParentLink};

/// 内建组件执行函数 - 每种组件的可重入状态机
///
/// A component either finishes in one visit (propagate, leave its slot
/// empty) or arranges a revisit: it stores an execution state and re-enqueues
/// itself as a continuous task. No execution function ever blocks.

/// Per-component state carried across visits, owned by one flow-state slot.
#[derive(Debug)]
pub enum ExecutionState {
    Delay(DelayState),
    Counter(CounterState),
    Loop(LoopState),
    Watch(WatchState),
    CallAction(CallActionState),
}

#[derive(Debug)]
pub struct DelayState {
    pub wake_at: u64,
}

#[derive(Debug)]
pub struct CounterState {
    pub remaining: i64,
}

#[derive(Debug)]
pub struct LoopState {
    pub target: AssignableRef,
    pub current: Value,
    pub to: Value,
    pub step: Value,
}

#[derive(Debug)]
pub struct WatchState {
    pub last: Value,
}

#[derive(Debug)]
pub struct CallActionState {
    pub child: FlowStateId,
}

impl ExecutionState {
    pub fn type_name(&self) -> &'static str {
        match self {
            ExecutionState::Delay(_) => "delay",
            ExecutionState::Counter(_) => "counter",
            ExecutionState::Loop(_) => "loop",
            ExecutionState::Watch(_) => "watch",
            ExecutionState::CallAction(_) => "call_action",
        }
    }
}

fn unexpected_state(found: &ExecutionState, expected: &'static str) -> MicroflowError {
    MicroflowError::Logic(format!(
        "unexpected `{}` execution state, expected `{expected}`",
        found.type_name()
    ))
}

pub(crate) fn execute(
    engine: &mut Engine,
    id: FlowStateId,
    component_index: usize,
    kind: &ComponentKind,
) -> Result<()> {
    match kind {
        ComponentKind::Start => {
            engine.propagate_through_seqout(id, component_index);
            Ok(())
        }
        ComponentKind::End => execute_end(engine, id),
        ComponentKind::FlowInput => {
            let value = engine.flow_input_value(id);
            engine.propagate_value(id, component_index, SEQOUT_INDEX, value);
            Ok(())
        }
        ComponentKind::FlowOutput { output_index } => {
            execute_flow_output(engine, id, component_index, *output_index)
        }
        ComponentKind::Constant { value } => {
            let value = engine.eval_in_component(id, component_index, value)?;
            engine.propagate_value(id, component_index, SEQOUT_INDEX, value);
            Ok(())
        }
        ComponentKind::SetVariable { variable, value } => {
            let target = eval_assignable_expression(variable)?;
            let value = engine.eval_in_component(id, component_index, value)?;
            engine.write_assignable(id, target, value)?;
            engine.propagate_through_seqout(id, component_index);
            Ok(())
        }
        ComponentKind::Switch { condition } => {
            let value = engine.eval_in_component(id, component_index, condition)?;
            let branch = match value {
                Value::Boolean(true) => SEQOUT_INDEX,
                Value::Boolean(false) => FALSE_OUTPUT_INDEX,
                other => {
                    return Err(MicroflowError::Evaluation(format!(
                        "switch condition evaluated to {}, expected boolean",
                        other.kind_name()
                    )))
                }
            };
            engine.propagate_value(id, component_index, branch, Value::Null);
            Ok(())
        }
        ComponentKind::Delay { milliseconds } => {
            execute_delay(engine, id, component_index, milliseconds)
        }
        ComponentKind::Counter { count } => execute_counter(engine, id, component_index, count),
        ComponentKind::Loop {
            variable,
            from,
            to,
            step,
        } => execute_loop(engine, id, component_index, variable, from, to, step),
        ComponentKind::TestAndSet { variable } => {
            execute_test_and_set(engine, id, component_index, variable)
        }
        ComponentKind::WatchVariable { expression } => {
            execute_watch_variable(engine, id, component_index, expression)
        }
        ComponentKind::CallAction { flow, input } => {
            execute_call_action(engine, id, component_index, *flow, input.as_ref())
        }
        ComponentKind::Log { message } => {
            let value = engine.eval_in_component(id, component_index, message)?;
            info!(flow_state = %id, "{value}");
            engine.propagate_through_seqout(id, component_index);
            Ok(())
        }
    }
}

/// Top level: finishes the instance. In a sub-flow: resumes the call site by
/// releasing its pin on this instance and ending its async wait.
fn execute_end(engine: &mut Engine, id: FlowStateId) -> Result<()> {
    match engine.parent_of(id) {
        Some(ParentLink {
            flow_state: parent,
            component_index: call_site,
        }) => {
            if let Some(call) = engine.take_call_state(parent, call_site) {
                debug_assert_eq!(call.child, id);
                // the dispatch pin keeps this state alive through the call
                engine.dec_ref(call.child);
            }
            engine.end_async_execution(parent, call_site);
            engine.propagate_through_seqout(parent, call_site);
        }
        None => engine.finish_flow(id),
    }
    Ok(())
}

fn execute_flow_output(
    engine: &mut Engine,
    id: FlowStateId,
    component_index: usize,
    output_index: usize,
) -> Result<()> {
    let parent = engine.parent_of(id).ok_or_else(|| {
        MicroflowError::Logic("flow output requires a parent flow state".to_string())
    })?;
    let value = engine.input_value(id, component_index, 0);
    engine.propagate_value(parent.flow_state, parent.component_index, output_index, value);
    engine.propagate_through_seqout(id, component_index);
    Ok(())
}

fn execute_delay(
    engine: &mut Engine,
    id: FlowStateId,
    component_index: usize,
    milliseconds: &Expression,
) -> Result<()> {
    let now = engine.clock_millis();
    let armed = match engine.exec_state(id, component_index) {
        None => None,
        Some(ExecutionState::Delay(state)) => Some(state.wake_at),
        Some(other) => return Err(unexpected_state(other, "delay")),
    };
    let wake_at = match armed {
        Some(wake_at) => wake_at,
        None => {
            let ms = engine
                .eval_in_component(id, component_index, milliseconds)?
                .as_float()
                .ok_or_else(|| {
                    MicroflowError::Evaluation("delay milliseconds must be numeric".to_string())
                })?;
            let wake_at = now + ms.max(0.0) as u64;
            engine.set_execution_state(
                id,
                component_index,
                Some(ExecutionState::Delay(DelayState { wake_at })),
            );
            wake_at
        }
    };

    if now >= wake_at {
        engine.set_execution_state(id, component_index, None);
        engine.propagate_through_seqout(id, component_index);
    } else {
        engine.enqueue_continuous(id, component_index);
    }
    Ok(())
}

fn execute_counter(
    engine: &mut Engine,
    id: FlowStateId,
    component_index: usize,
    count: &Expression,
) -> Result<()> {
    let existing = match engine.exec_state(id, component_index) {
        None => None,
        Some(ExecutionState::Counter(state)) => Some(state.remaining),
        Some(other) => return Err(unexpected_state(other, "counter")),
    };
    let remaining = match existing {
        Some(remaining) => remaining,
        None => {
            // a fresh visit after "done" re-evaluates the count property
            let remaining = engine
                .eval_in_component(id, component_index, count)?
                .as_integer()
                .ok_or_else(|| {
                    MicroflowError::Evaluation("counter count must be an integer".to_string())
                })?;
            engine.set_execution_state(
                id,
                component_index,
                Some(ExecutionState::Counter(CounterState { remaining })),
            );
            remaining
        }
    };

    if remaining > 0 {
        if let Some(ExecutionState::Counter(state)) = engine.exec_state_mut(id, component_index) {
            state.remaining -= 1;
        }
        engine.propagate_through_seqout(id, component_index);
    } else {
        engine.set_execution_state(id, component_index, None);
        engine.propagate_value(id, component_index, DONE_OUTPUT_INDEX, Value::Null);
    }
    Ok(())
}

fn execute_loop(
    engine: &mut Engine,
    id: FlowStateId,
    component_index: usize,
    variable: &Expression,
    from: &Expression,
    to: &Expression,
    step: &Expression,
) -> Result<()> {
    let existing = match engine.exec_state(id, component_index) {
        None => None,
        Some(ExecutionState::Loop(state)) => Some((
            state.target,
            state.current.clone(),
            state.to.clone(),
            state.step.clone(),
        )),
        Some(other) => return Err(unexpected_state(other, "loop")),
    };
    match existing {
        None => {
            // entry visit: seed the induction variable and emit the first body pass
            let target = eval_assignable_expression(variable)?;
            let from = engine.eval_in_component(id, component_index, from)?;
            let to = engine.eval_in_component(id, component_index, to)?;
            let step = engine.eval_in_component(id, component_index, step)?;
            if from.as_float().is_none() || to.as_float().is_none() {
                return Err(MicroflowError::Evaluation(
                    "loop bounds must be numeric".to_string(),
                ));
            }
            match step.as_float() {
                None => {
                    return Err(MicroflowError::Evaluation(
                        "loop step must be numeric".to_string(),
                    ))
                }
                Some(s) if s == 0.0 => {
                    return Err(MicroflowError::Evaluation(
                        "loop step must be non-zero".to_string(),
                    ))
                }
                _ => {}
            }
            engine.write_assignable(id, target, from.clone())?;
            engine.set_execution_state(
                id,
                component_index,
                Some(ExecutionState::Loop(LoopState {
                    target,
                    current: from.clone(),
                    to,
                    step,
                })),
            );
            engine.propagate_value(id, component_index, SEQOUT_INDEX, from);
        }
        Some((target, current, to, step)) => {
            // the body looped back; step and either re-emit or finish
            let next = current.numeric_add(&step).ok_or_else(|| {
                MicroflowError::Evaluation("loop arithmetic on non-numeric value".to_string())
            })?;
            let ascending = step
                .numeric_cmp(&Value::Integer(0))
                .map(|ordering| ordering.is_gt())
                .unwrap_or(true);
            let done = match next.numeric_cmp(&to) {
                Some(ordering) => {
                    if ascending {
                        ordering.is_gt()
                    } else {
                        ordering.is_lt()
                    }
                }
                None => true,
            };
            if done {
                engine.set_execution_state(id, component_index, None);
                engine.propagate_value(id, component_index, DONE_OUTPUT_INDEX, Value::Null);
            } else {
                if let Some(ExecutionState::Loop(state)) =
                    engine.exec_state_mut(id, component_index)
                {
                    state.current = next.clone();
                }
                engine.write_assignable(id, target, next.clone())?;
                engine.propagate_value(id, component_index, SEQOUT_INDEX, next);
            }
        }
    }
    Ok(())
}

/// Spin-wait gate: acquires the boolean variable or polls again next tick.
fn execute_test_and_set(
    engine: &mut Engine,
    id: FlowStateId,
    component_index: usize,
    variable: &Expression,
) -> Result<()> {
    let target = eval_assignable_expression(variable)?;
    let current = engine.read_assignable(id, target)?;
    if current.as_boolean() {
        engine.enqueue_continuous(id, component_index);
    } else {
        engine.write_assignable(id, target, Value::Boolean(true))?;
        engine.propagate_through_seqout(id, component_index);
    }
    Ok(())
}

fn execute_watch_variable(
    engine: &mut Engine,
    id: FlowStateId,
    component_index: usize,
    expression: &Expression,
) -> Result<()> {
    let value = engine.eval_in_component(id, component_index, expression)?;
    let observed = match engine.exec_state(id, component_index) {
        None => None,
        Some(ExecutionState::Watch(state)) => Some(state.last == value),
        Some(other) => return Err(unexpected_state(other, "watch")),
    };
    match observed {
        None => {
            // first visit records the baseline and links the watch node;
            // propagation happens only on a later change
            engine.add_watch(id, component_index);
            engine.set_execution_state(
                id,
                component_index,
                Some(ExecutionState::Watch(WatchState { last: value })),
            );
        }
        Some(true) => {}
        Some(false) => {
            if let Some(ExecutionState::Watch(state)) = engine.exec_state_mut(id, component_index)
            {
                state.last = value.clone();
            }
            engine.propagate_value(id, component_index, SEQOUT_INDEX, value);
        }
    }
    Ok(())
}

fn execute_call_action(
    engine: &mut Engine,
    id: FlowStateId,
    component_index: usize,
    flow: usize,
    input: Option<&Expression>,
) -> Result<()> {
    if engine.exec_state(id, component_index).is_some() {
        return Err(MicroflowError::Logic(
            "call action re-entered while its child flow is active".to_string(),
        ));
    }
    let input = match input {
        Some(expression) => engine.eval_in_component(id, component_index, expression)?,
        None => Value::Undefined,
    };
    let child = engine.create_flow_state(
        flow,
        Some(ParentLink {
            flow_state: id,
            component_index,
        }),
        input,
    )?;
    // the call site owns the child's creation pin until the child Ends
    engine.set_execution_state(
        id,
        component_index,
        Some(ExecutionState::CallAction(CallActionState { child })),
    );
    engine.begin_async_execution(id, component_index);
    engine.seed_flow(child)?;
    Ok(())
}
