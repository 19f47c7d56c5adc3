//! Host ABI exposed to sandboxed handlers.
//!
//! These functions are the only doors out of the sandbox. The engine
//! binding registers them under stable names; the in-sandbox bootstrap
//! wraps them as `$state`, `$emit`, `$view`, `$log`, `$time` and `$ext`.
//! Arguments and return values cross the boundary as length-prefixed
//! MessagePack buffers; the signatures here are the decoded host side.
//!
//! Every inbound call charges the per-invocation host-call counter and is
//! therefore also a timeout safe point. Integer status codes reported to
//! the guest describe the ABI call itself, never application semantics.

pub mod events;
pub mod extension;
pub mod logging;
pub mod state;
pub mod time;
pub mod view;

use crate::context::SharedContext;
use crate::error::AbiResult;

/// Charge one host call against the invocation budget and record the
/// function name for metrics. Called first by every ABI entry point.
pub(crate) fn charge(ctx: &SharedContext, name: &'static str) -> AbiResult<()> {
    let mut context = ctx.lock();
    context.count_host_call(name);
    context.enforcer.charge_host_call()
}

/// Deadline check with no counter charge.
///
/// The bootstrap installs calls to this at periodic yield points in
/// generated code so compute-only handlers are interruptible; it must not
/// consume host-call budget.
pub fn yield_check(ctx: &SharedContext) -> AbiResult<()> {
    ctx.lock().enforcer.check_deadline()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionLimits;
    use crate::context::{ExecutionContext, HandlerContext};
    use crate::error::{AbiFault, ResourceKind};

    fn shared(max_host_calls: u32) -> SharedContext {
        let mut limits = ExecutionLimits::default();
        limits.max_host_calls = max_host_calls;
        let mut ec = ExecutionContext::new(HandlerContext::new("p", "h"), limits);
        ec.enforcer.arm();
        ec.into_shared()
    }

    #[test]
    fn test_charge_counts_and_limits() {
        let ctx = shared(2);

        assert!(charge(&ctx, "state_get").is_ok());
        assert!(charge(&ctx, "state_get").is_ok());
        assert_eq!(
            charge(&ctx, "state_get"),
            Err(AbiFault::ResourceLimit(ResourceKind::HostCalls))
        );

        // All three attempts were recorded for metrics.
        assert_eq!(ctx.lock().host_call_counts.get("state_get"), Some(&3));
    }

    #[test]
    fn test_yield_check_is_free() {
        let ctx = shared(1);

        for _ in 0..10 {
            assert!(yield_check(&ctx).is_ok());
        }
        // Budget untouched by yield checks.
        assert!(charge(&ctx, "emit").is_ok());
    }
}
