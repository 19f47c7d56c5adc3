//! Time ABI.
//!
//! The sandbox has no timer API of its own; `$time.now()` is the only
//! clock handlers can observe, and it is the host's wall clock.

use super::charge;
use crate::context::SharedContext;
use crate::error::AbiResult;

/// Current wall-clock time in milliseconds since the Unix epoch, as seen
/// by the host.
pub fn now(ctx: &SharedContext) -> AbiResult<i64> {
    charge(ctx, "now")?;
    Ok(chrono::Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionLimits;
    use crate::context::{ExecutionContext, HandlerContext};

    #[test]
    fn test_now_is_plausible() {
        let mut ec =
            ExecutionContext::new(HandlerContext::new("p", "h"), ExecutionLimits::default());
        ec.enforcer.arm();
        let ctx = ec.into_shared();

        let ms = now(&ctx).unwrap();
        // After 2020-01-01 and charged as a host call.
        assert!(ms > 1_577_836_800_000);
        assert_eq!(ctx.lock().host_call_counts.get("now"), Some(&1));
    }
}
