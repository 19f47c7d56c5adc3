//! Event emission ABI.

use super::charge;
use crate::context::{EmittedEvent, SharedContext};
use crate::error::AbiResult;
use crate::value::RuntimeValue;
use std::collections::HashMap;

/// Emit an event. The event lands in the shared effect buffer and is
/// delivered to the host at the next boundary crossing.
pub fn emit(ctx: &SharedContext, name: &str, payload: RuntimeValue) -> AbiResult<()> {
    charge(ctx, "emit")?;
    let mut context = ctx.lock();
    context.enforcer.charge_event()?;
    context.push_event(EmittedEvent::new(name, payload));
    Ok(())
}

/// Emit a `toast` event with the conventional payload shape.
pub fn emit_toast(ctx: &SharedContext, message: &str, toast_type: Option<&str>) -> AbiResult<()> {
    let mut payload = HashMap::new();
    payload.insert("message".to_string(), RuntimeValue::from(message));
    payload.insert(
        "type".to_string(),
        RuntimeValue::from(toast_type.unwrap_or("info")),
    );

    emit(ctx, "toast", RuntimeValue::Map(payload))
}
