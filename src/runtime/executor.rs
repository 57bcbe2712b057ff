use tracing::trace;

use super::components;
use super::engine::Engine;
use super::states::FlowStateId;

/// 组件分发 - 按类型标签选择执行函数
///
/// Every execution function returns normally; an `Err` from a component body
/// is converted into a reported flow error here and never crosses the
/// dispatch boundary.
pub(crate) fn execute_component(engine: &mut Engine, id: FlowStateId, component_index: usize) {
    let bundle = engine.bundle_arc();
    let Some(flow_index) = engine.flow_index_of(id) else {
        // a queued or watched entry always pins its owner
        debug_assert!(false, "dispatch against a freed flow state");
        return;
    };
    let definition = match bundle.flow(flow_index) {
        Ok(definition) => definition,
        Err(err) => {
            engine.throw_error(id, component_index, &err.to_string());
            return;
        }
    };
    let component = match definition.component(component_index) {
        Ok(component) => component,
        Err(err) => {
            engine.throw_error(id, component_index, &err.to_string());
            return;
        }
    };

    trace!(
        flow_state = %id,
        component = %component.name,
        kind = component.kind.type_name(),
        "execute"
    );

    if let Err(err) = components::execute(engine, id, component_index, &component.kind) {
        engine.throw_error(id, component_index, &err.to_string());
    }
}
