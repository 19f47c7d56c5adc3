//! State access ABI.
//!
//! Reads go through the instance's write-through mirror, so a handler sees
//! its own mutations immediately even though the host only observes them at
//! the next boundary crossing. Writes to computed keys are rejected with a
//! script-visible fault.

use super::charge;
use crate::context::SharedContext;
use crate::error::{AbiFault, AbiResult};
use crate::value::RuntimeValue;

/// Read a state value. Returns `None` if the key does not exist.
pub fn get(ctx: &SharedContext, key: &str) -> AbiResult<Option<RuntimeValue>> {
    charge(ctx, "state_get")?;
    let context = ctx.lock();
    Ok(context.state.get(key).cloned())
}

/// Write a state value.
///
/// Appends a `StateMutation` to the effect buffer and updates the mirror so
/// subsequent reads within the same invocation see the new value.
pub fn set(ctx: &SharedContext, key: &str, value: RuntimeValue) -> AbiResult<()> {
    charge(ctx, "state_set")?;
    let mut context = ctx.lock();

    if context.computed_keys.contains(key) {
        return Err(AbiFault::ReadOnlyComputed(key.to_string()));
    }

    context.enforcer.charge_state_mutation()?;
    context.apply_set(key, value);
    Ok(())
}

/// Delete a state key.
pub fn delete(ctx: &SharedContext, key: &str) -> AbiResult<()> {
    charge(ctx, "state_delete")?;
    let mut context = ctx.lock();

    if context.computed_keys.contains(key) {
        return Err(AbiFault::ReadOnlyComputed(key.to_string()));
    }

    context.enforcer.charge_state_mutation()?;
    context.apply_delete(key);
    Ok(())
}

/// Check whether a state key exists.
pub fn has(ctx: &SharedContext, key: &str) -> AbiResult<bool> {
    charge(ctx, "state_has")?;
    let context = ctx.lock();
    Ok(context.state.contains_key(key))
}

/// List all state keys.
pub fn keys(ctx: &SharedContext) -> AbiResult<Vec<String>> {
    charge(ctx, "state_keys")?;
    let context = ctx.lock();
    let mut keys: Vec<String> = context.state.keys().cloned().collect();
    keys.sort();
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionLimits;
    use crate::context::{Effect, ExecutionContext, HandlerContext, MutationOp};
    use crate::error::ResourceKind;
    use std::collections::HashMap;

    fn shared_with_state() -> SharedContext {
        let mut state = HashMap::new();
        state.insert("count".to_string(), RuntimeValue::Int(42));
        state.insert("name".to_string(), RuntimeValue::from("test"));

        let hctx = HandlerContext::new("test-panel", "test-handler")
            .with_state(state)
            .with_computed_keys(vec!["total".to_string()]);

        let mut ec = ExecutionContext::new(hctx, ExecutionLimits::default());
        ec.enforcer.arm();
        ec.into_shared()
    }

    #[test]
    fn test_get_existing_and_missing() {
        let ctx = shared_with_state();

        assert_eq!(get(&ctx, "count"), Ok(Some(RuntimeValue::Int(42))));
        assert_eq!(get(&ctx, "missing"), Ok(None));
    }

    #[test]
    fn test_set_records_mutation_and_updates_mirror() {
        let ctx = shared_with_state();

        set(&ctx, "count", RuntimeValue::Int(100)).unwrap();

        // Same-invocation read sees the write.
        assert_eq!(get(&ctx, "count"), Ok(Some(RuntimeValue::Int(100))));

        let context = ctx.lock();
        assert_eq!(context.effects.len(), 1);
        assert!(
            matches!(&context.effects[0], Effect::State(m) if m.key == "count" && m.op == MutationOp::Set)
        );
    }

    #[test]
    fn test_set_computed_key_rejected() {
        let ctx = shared_with_state();

        assert_eq!(
            set(&ctx, "total", RuntimeValue::Int(1)),
            Err(AbiFault::ReadOnlyComputed("total".to_string()))
        );
        assert_eq!(
            delete(&ctx, "total"),
            Err(AbiFault::ReadOnlyComputed("total".to_string()))
        );

        // Rejected writes leave no effects and no mutation charge.
        assert!(ctx.lock().effects.is_empty());
    }

    #[test]
    fn test_delete_removes_from_mirror() {
        let ctx = shared_with_state();

        delete(&ctx, "count").unwrap();
        assert_eq!(get(&ctx, "count"), Ok(None));
        assert_eq!(has(&ctx, "count"), Ok(false));
    }

    #[test]
    fn test_has_and_keys() {
        let ctx = shared_with_state();

        assert_eq!(has(&ctx, "count"), Ok(true));
        assert_eq!(has(&ctx, "missing"), Ok(false));

        let keys = keys(&ctx).unwrap();
        assert_eq!(keys, vec!["count".to_string(), "name".to_string()]);
    }

    #[test]
    fn test_mutation_ceiling() {
        let mut limits = ExecutionLimits::default();
        limits.max_state_mutations = 2;
        let mut ec = ExecutionContext::new(HandlerContext::new("p", "h"), limits);
        ec.enforcer.arm();
        let ctx = ec.into_shared();

        set(&ctx, "a", RuntimeValue::Int(1)).unwrap();
        set(&ctx, "b", RuntimeValue::Int(2)).unwrap();
        assert_eq!(
            set(&ctx, "c", RuntimeValue::Int(3)),
            Err(AbiFault::ResourceLimit(ResourceKind::StateMutations))
        );

        // Exactly the two admitted mutations are buffered.
        assert_eq!(ctx.lock().effects.len(), 2);
    }
}
