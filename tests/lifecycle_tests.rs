use std::sync::Arc;

use parking_lot::Mutex;

use microflow::{
    ComponentKind, DebuggerHooks, Engine, Expression, FlowBuilder, FlowBundle, FlowStateId,
    ManualClock, MicroflowError, Value,
};

#[derive(Clone, Default)]
struct LifecycleObserver {
    created: Arc<Mutex<Vec<FlowStateId>>>,
    destroyed: Arc<Mutex<Vec<FlowStateId>>>,
}

impl DebuggerHooks for LifecycleObserver {
    fn on_flow_state_created(&mut self, flow_state: FlowStateId) {
        self.created.lock().push(flow_state);
    }

    fn on_flow_state_destroyed(&mut self, flow_state: FlowStateId) {
        self.destroyed.lock().push(flow_state);
    }
}

fn run_until_idle(engine: &mut Engine, max_ticks: usize) {
    for _ in 0..max_ticks {
        if engine.is_idle() {
            return;
        }
        engine.tick();
    }
    panic!("engine did not go idle within {max_ticks} ticks");
}

fn start_end_flow() -> FlowBundle {
    let mut builder = FlowBuilder::new("main");
    builder
        .add_component("start", ComponentKind::Start)
        .add_component("end", ComponentKind::End)
        .connect_seqout("start", "end");
    FlowBundle::new(vec![builder.build().unwrap()])
}

#[test]
fn destroy_runs_exactly_once_per_instance() -> anyhow::Result<()> {
    let observer = LifecycleObserver::default();
    let mut engine = Engine::new(start_end_flow()).with_hooks(Box::new(observer.clone()));

    let first = engine.start_flow(0, Value::Undefined)?;
    let second = engine.start_flow(0, Value::Undefined)?;
    run_until_idle(&mut engine, 16);

    let created = observer.created.lock().clone();
    let destroyed = observer.destroyed.lock().clone();
    assert_eq!(created, vec![first, second]);
    assert_eq!(destroyed.len(), 2);
    for id in &created {
        assert_eq!(
            destroyed.iter().filter(|d| *d == id).count(),
            1,
            "flow state {id} must be destroyed exactly once"
        );
    }
    assert_eq!(engine.live_flow_states(), 0);
    Ok(())
}

#[test]
fn interleaved_instances_share_the_scheduler_fairly() -> anyhow::Result<()> {
    // two instances of the same definition tick forward without starving
    // each other and both reach their End
    let mut engine = Engine::new(start_end_flow());
    engine.start_flow(0, Value::Undefined)?;
    engine.start_flow(0, Value::Undefined)?;
    assert_eq!(engine.live_flow_states(), 2);
    run_until_idle(&mut engine, 16);
    assert_eq!(engine.live_flow_states(), 0);
    Ok(())
}

#[test]
fn stop_tears_down_armed_timers() -> anyhow::Result<()> {
    let mut builder = FlowBuilder::new("main");
    builder
        .add_component("start", ComponentKind::Start)
        .add_component(
            "delay",
            ComponentKind::Delay {
                milliseconds: Expression::literal(60_000i64),
            },
        )
        .add_component("end", ComponentKind::End)
        .connect_seqout("start", "delay")
        .connect_seqout("delay", "end");
    let bundle = FlowBundle::new(vec![builder.build().unwrap()]);

    let observer = LifecycleObserver::default();
    let clock = ManualClock::new();
    let mut engine = Engine::new(bundle)
        .with_clock(Box::new(clock.clone()))
        .with_hooks(Box::new(observer.clone()));
    engine.start_flow(0, Value::Undefined)?;

    engine.tick();
    engine.tick();
    // the delay is armed and re-enqueueing; the instance cannot finish on
    // its own
    assert_eq!(engine.queue_len(), 1);
    assert_eq!(engine.live_flow_states(), 1);

    engine.stop();
    assert_eq!(engine.queue_len(), 0);
    assert_eq!(engine.live_flow_states(), 0);
    assert_eq!(observer.destroyed.lock().len(), 1);

    // a tick after shutdown is a no-op, not a crash
    engine.tick();
    Ok(())
}

#[test]
fn arena_exhaustion_is_a_recoverable_error() -> anyhow::Result<()> {
    let mut engine = Engine::new(start_end_flow()).with_state_capacity(1);
    engine.start_flow(0, Value::Undefined)?;
    match engine.start_flow(0, Value::Undefined) {
        Err(MicroflowError::ResourceExhausted { capacity: 1 }) => {}
        other => panic!("expected arena exhaustion, got {other:?}"),
    }
    // the first instance is unaffected and still completes
    run_until_idle(&mut engine, 16);
    // a slot freed by completion can be reused
    engine.start_flow(0, Value::Undefined)?;
    run_until_idle(&mut engine, 16);
    Ok(())
}

#[test]
fn unknown_flow_name_is_rejected() {
    let mut engine = Engine::new(start_end_flow());
    assert!(matches!(
        engine.start_flow_by_name("bogus", Value::Undefined),
        Err(MicroflowError::UnknownFlow(_))
    ));
}
