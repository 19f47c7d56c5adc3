//! View command ABI.
//!
//! Handlers manipulate the hydrated view imperatively through these calls.
//! Commands ride the shared effect buffer; only the host-call counter
//! bounds them.

use super::charge;
use crate::context::{SharedContext, ViewCommand};
use crate::error::AbiResult;
use crate::value::RuntimeValue;
use std::collections::HashMap;

/// Set a filter on a component.
pub fn set_filter(ctx: &SharedContext, component_id: &str, value: RuntimeValue) -> AbiResult<()> {
    charge(ctx, "view_set_filter")?;
    ctx.lock()
        .push_view_command(ViewCommand::set_filter(component_id, value));
    Ok(())
}

/// Scroll a component to a position.
pub fn scroll_to(ctx: &SharedContext, component_id: &str, position: RuntimeValue) -> AbiResult<()> {
    charge(ctx, "view_scroll_to")?;
    ctx.lock()
        .push_view_command(ViewCommand::scroll_to(component_id, position));
    Ok(())
}

/// Focus a component.
pub fn focus(ctx: &SharedContext, component_id: &str) -> AbiResult<()> {
    charge(ctx, "view_focus")?;
    ctx.lock().push_view_command(ViewCommand::focus(component_id));
    Ok(())
}

/// Send a custom command to a component.
pub fn command(
    ctx: &SharedContext,
    component_id: Option<&str>,
    name: &str,
    mut args: HashMap<String, RuntimeValue>,
) -> AbiResult<()> {
    charge(ctx, "view_command")?;
    args.insert("command".to_string(), RuntimeValue::from(name));
    ctx.lock()
        .push_view_command(ViewCommand::custom(component_id.map(String::from), args));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionLimits;
    use crate::context::{Effect, ExecutionContext, HandlerContext, ViewCommandType};

    fn shared() -> SharedContext {
        let mut ec =
            ExecutionContext::new(HandlerContext::new("p", "h"), ExecutionLimits::default());
        ec.enforcer.arm();
        ec.into_shared()
    }

    #[test]
    fn test_set_filter() {
        let ctx = shared();

        set_filter(&ctx, "logs", RuntimeValue::from("error")).unwrap();

        let context = ctx.lock();
        let Effect::View(cmd) = &context.effects[0] else {
            panic!("expected view effect");
        };
        assert_eq!(cmd.command_type, ViewCommandType::SetFilter);
        assert_eq!(cmd.component_id.as_deref(), Some("logs"));
    }

    #[test]
    fn test_scroll_and_focus() {
        let ctx = shared();

        scroll_to(&ctx, "list", RuntimeValue::from("bottom")).unwrap();
        focus(&ctx, "input").unwrap();

        let context = ctx.lock();
        assert_eq!(context.effects.len(), 2);
        assert!(matches!(
            &context.effects[0],
            Effect::View(c) if c.command_type == ViewCommandType::ScrollTo
        ));
        assert!(matches!(
            &context.effects[1],
            Effect::View(c) if c.command_type == ViewCommandType::Focus
        ));
    }

    #[test]
    fn test_custom_command_carries_name() {
        let ctx = shared();

        let mut args = HashMap::new();
        args.insert("page".to_string(), RuntimeValue::Int(2));
        command(&ctx, Some("chart"), "redraw", args).unwrap();

        let context = ctx.lock();
        let Effect::View(cmd) = &context.effects[0] else {
            panic!("expected view effect");
        };
        assert_eq!(cmd.command_type, ViewCommandType::Custom);
        assert_eq!(
            cmd.args.get("command").and_then(|v| v.as_str()),
            Some("redraw")
        );
        assert_eq!(cmd.args.get("page"), Some(&RuntimeValue::Int(2)));
    }
}
