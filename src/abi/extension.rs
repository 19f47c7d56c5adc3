//! Extension ABI: introspection and the suspension entry point.
//!
//! `ext_suspend` is how every async extension call leaves the sandbox. It
//! never returns a value to the script; it records a suspension on the
//! execution context and the engine binding unwinds, so the instance can
//! park and the host can perform the I/O. The extension registry in the
//! context is the ground truth for what a handler may call; capability
//! tokens are an additional hint enforced only when present.

use super::charge;
use crate::context::{SharedContext, SuspensionDetails, SuspensionState};
use crate::error::{AbiFault, AbiResult};
use crate::value::RuntimeValue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide suspension ID source. IDs are unique for the lifetime of
/// the process and never reused.
static NEXT_SUSPENSION_ID: AtomicU64 = AtomicU64::new(1);

fn allocate_suspension_id() -> String {
    format!("s-{}", NEXT_SUSPENSION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Check whether an extension is registered for this invocation.
pub fn exists(ctx: &SharedContext, ext_name: &str) -> AbiResult<bool> {
    charge(ctx, "ext_exists")?;
    Ok(ctx.lock().extension_registry.contains_key(ext_name))
}

/// List the methods an extension exposes.
pub fn methods(ctx: &SharedContext, ext_name: &str) -> AbiResult<Vec<String>> {
    charge(ctx, "ext_methods")?;
    let context = ctx.lock();
    Ok(context
        .extension_registry
        .get(ext_name)
        .cloned()
        .unwrap_or_default())
}

/// List all registered extensions.
pub fn list(ctx: &SharedContext) -> AbiResult<Vec<String>> {
    charge(ctx, "ext_list")?;
    let context = ctx.lock();
    let mut names: Vec<String> = context.extension_registry.keys().cloned().collect();
    names.sort();
    Ok(names)
}

/// Suspend execution for an async extension call.
///
/// Validates the call against the registry (and the capability hint when
/// one was granted), allocates a fresh suspension ID, and records the
/// suspension. The binding observes the recorded suspension and reports
/// `VmOutcome::Suspended`; the instance then parks.
pub fn suspend(
    ctx: &SharedContext,
    ext_name: &str,
    method: &str,
    args: Vec<RuntimeValue>,
) -> AbiResult<SuspensionDetails> {
    charge(ctx, "ext_suspend")?;
    let mut context = ctx.lock();

    let registered = context
        .extension_registry
        .get(ext_name)
        .map(|methods| methods.iter().any(|m| m == method))
        .unwrap_or(false);
    if !registered {
        return Err(AbiFault::PermissionDenied(format!(
            "ext:{}:{}",
            ext_name, method
        )));
    }

    if !context.capabilities.is_empty() && !context.capabilities.can_access_extension(ext_name) {
        return Err(AbiFault::PermissionDenied(format!("ext:{}", ext_name)));
    }

    // Serial-only: the binding parks before the script can issue another
    // call, so a pending suspension here is a binding bug.
    debug_assert!(context.suspension.is_none(), "suspension already pending");

    let suspension_id = allocate_suspension_id();
    context.suspension = Some(SuspensionState {
        id: suspension_id.clone(),
        extension_name: ext_name.to_string(),
        method: method.to_string(),
        args: args.clone(),
    });

    Ok(SuspensionDetails {
        suspension_id,
        extension_name: ext_name.to_string(),
        method: method.to_string(),
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityToken;
    use crate::config::ExecutionLimits;
    use crate::context::{ExecutionContext, HandlerContext};
    use std::collections::HashMap;

    fn registry() -> HashMap<String, Vec<String>> {
        let mut ext = HashMap::new();
        ext.insert(
            "http".to_string(),
            vec!["get".to_string(), "post".to_string()],
        );
        ext.insert("kv".to_string(), vec!["read".to_string()]);
        ext
    }

    fn shared(caps: Vec<CapabilityToken>) -> SharedContext {
        let hctx = HandlerContext::new("test-panel", "test-handler")
            .with_extensions(registry())
            .with_capabilities(caps);
        let mut ec = ExecutionContext::new(hctx, ExecutionLimits::default());
        ec.enforcer.arm();
        ec.into_shared()
    }

    #[test]
    fn test_suspend_records_state() {
        let ctx = shared(vec![]);

        let details = suspend(&ctx, "http", "get", vec![RuntimeValue::from("u")]).unwrap();
        assert_eq!(details.extension_name, "http");
        assert_eq!(details.method, "get");
        assert!(details.suspension_id.starts_with("s-"));

        let context = ctx.lock();
        let suspension = context.suspension.as_ref().expect("recorded");
        assert_eq!(suspension.id, details.suspension_id);
        assert_eq!(suspension.args, vec![RuntimeValue::from("u")]);
    }

    #[test]
    fn test_suspension_ids_unique() {
        let a = shared(vec![]);
        let b = shared(vec![]);

        let first = suspend(&a, "http", "get", vec![]).unwrap();
        let second = suspend(&b, "http", "get", vec![]).unwrap();
        assert_ne!(first.suspension_id, second.suspension_id);
    }

    #[test]
    fn test_unregistered_extension_denied() {
        let ctx = shared(vec![]);

        assert_eq!(
            suspend(&ctx, "fs", "read", vec![]),
            Err(AbiFault::PermissionDenied("ext:fs:read".to_string()))
        );
    }

    #[test]
    fn test_unregistered_method_denied() {
        let ctx = shared(vec![]);

        assert_eq!(
            suspend(&ctx, "http", "delete", vec![]),
            Err(AbiFault::PermissionDenied("ext:http:delete".to_string()))
        );
    }

    #[test]
    fn test_capability_hint_enforced_when_present() {
        let ctx = shared(vec![CapabilityToken::Extension("kv".to_string())]);

        assert!(suspend(&ctx, "kv", "read", vec![]).is_ok());

        let ctx = shared(vec![CapabilityToken::Extension("kv".to_string())]);
        assert_eq!(
            suspend(&ctx, "http", "get", vec![]),
            Err(AbiFault::PermissionDenied("ext:http".to_string()))
        );
    }

    #[test]
    fn test_introspection() {
        let ctx = shared(vec![]);

        assert_eq!(exists(&ctx, "http"), Ok(true));
        assert_eq!(exists(&ctx, "fs"), Ok(false));

        let methods = methods(&ctx, "http").unwrap();
        assert!(methods.contains(&"get".to_string()));
        assert!(methods.contains(&"post".to_string()));

        assert_eq!(list(&ctx), Ok(vec!["http".to_string(), "kv".to_string()]));
    }
}
