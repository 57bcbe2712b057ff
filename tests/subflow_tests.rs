use std::sync::Arc;

use parking_lot::Mutex;

use microflow::{
    BinaryOp, ComponentKind, DebuggerHooks, Engine, Expression, FlowBuilder, FlowBundle,
    FlowStateId, Value,
};

#[derive(Clone, Default)]
struct LifecycleObserver {
    created: Arc<Mutex<usize>>,
    destroyed: Arc<Mutex<usize>>,
    async_changes: Arc<Mutex<Vec<(FlowStateId, usize)>>>,
}

impl DebuggerHooks for LifecycleObserver {
    fn on_flow_state_created(&mut self, _flow_state: FlowStateId) {
        *self.created.lock() += 1;
    }

    fn on_flow_state_destroyed(&mut self, _flow_state: FlowStateId) {
        *self.destroyed.lock() += 1;
    }

    fn on_component_async_state_changed(&mut self, flow_state: FlowStateId, component_index: usize) {
        self.async_changes.lock().push((flow_state, component_index));
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

/// main 调 child：输入 41 传入，child 透传回 call 站点的数据输出
fn call_bundle(with_main_end: bool) -> FlowBundle {
    let mut child = FlowBuilder::new("child");
    child
        .add_component("start", ComponentKind::Start)
        .add_component("input", ComponentKind::FlowInput)
        .add_component("output", ComponentKind::FlowOutput { output_index: 1 })
        .add_component("end", ComponentKind::End)
        .connect_seqout("start", "input")
        .connect_seqout("input", "output")
        .connect_seqout("output", "end");
    let child = child.build().unwrap();

    let mut main = FlowBuilder::new("main");
    main.declare_variable("result", 0i64)
        .declare_variable("returned", false);
    let result = main.variable_ref("result").unwrap();
    let returned = main.variable_ref("returned").unwrap();
    main.add_component("start", ComponentKind::Start)
        .add_component(
            "call",
            ComponentKind::CallAction {
                flow: 1,
                input: Some(Expression::literal(41i64)),
            },
        )
        .add_component(
            "store",
            ComponentKind::SetVariable {
                variable: result,
                value: Expression::binary(
                    BinaryOp::Add,
                    Expression::input(0),
                    Expression::literal(1i64),
                ),
            },
        )
        .add_component(
            "mark",
            ComponentKind::SetVariable {
                variable: returned,
                value: Expression::literal(true),
            },
        )
        .connect_seqout("start", "call")
        .connect("call", 0, "mark", 0)
        .connect("call", 1, "store", 0);
    if with_main_end {
        main.add_component("end", ComponentKind::End)
            .connect_seqout("mark", "end");
    }
    let main = main.build().unwrap();

    FlowBundle::new(vec![main, child])
}

#[test]
fn call_action_round_trip() -> anyhow::Result<()> {
    let mut engine = Engine::new(call_bundle(false));
    let id = engine.start_flow(0, Value::Undefined)?;

    for _ in 0..12 {
        engine.tick();
    }

    // the child's pass-through value landed on the call's data output
    assert_eq!(engine.get_variable(id, "result")?, Value::Integer(42));
    // the child's End resumed the call site's seqout
    assert_eq!(engine.get_variable(id, "returned")?, Value::Boolean(true));
    // only the parent instance survives
    assert_eq!(engine.live_flow_states(), 1);
    assert_eq!(engine.queue_len(), 0);
    Ok(())
}

#[test]
fn child_lifetime_is_bracketed_by_the_call() -> anyhow::Result<()> {
    let observer = LifecycleObserver::default();
    let mut engine = Engine::new(call_bundle(true)).with_hooks(Box::new(observer.clone()));
    let parent = engine.start_flow(0, Value::Undefined)?;
    let call_index = engine
        .bundle()
        .flows()[0]
        .component_index("call")
        .unwrap();

    run_until_idle(&mut engine, 24);

    assert_eq!(*observer.created.lock(), 2);
    assert_eq!(*observer.destroyed.lock(), 2);
    // the call site went async when the child started and came back when
    // the child's End resolved it
    let async_changes = observer.async_changes.lock().clone();
    assert_eq!(async_changes, vec![(parent, call_index), (parent, call_index)]);
    Ok(())
}

#[test]
fn stop_reclaims_a_parked_call() -> anyhow::Result<()> {
    // child that never Ends: the call site waits forever until stop()
    let mut child = FlowBuilder::new("child");
    child
        .add_component("start", ComponentKind::Start)
        .add_component(
            "delay",
            ComponentKind::Delay {
                milliseconds: Expression::literal(1_000_000i64),
            },
        )
        .connect_seqout("start", "delay");
    let child = child.build().unwrap();

    let mut main = FlowBuilder::new("main");
    main.add_component("start", ComponentKind::Start)
        .add_component(
            "call",
            ComponentKind::CallAction {
                flow: 1,
                input: None,
            },
        )
        .connect_seqout("start", "call");
    let main = main.build().unwrap();

    let observer = LifecycleObserver::default();
    let mut engine =
        Engine::new(FlowBundle::new(vec![main, child])).with_hooks(Box::new(observer.clone()));
    engine.start_flow(0, Value::Undefined)?;

    for _ in 0..6 {
        engine.tick();
    }
    assert_eq!(engine.live_flow_states(), 2);

    engine.stop();
    assert_eq!(engine.live_flow_states(), 0);
    assert_eq!(engine.queue_len(), 0);
    assert_eq!(*observer.destroyed.lock(), 2);
    Ok(())
}
