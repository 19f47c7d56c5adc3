//! Logging ABI.
//!
//! `$log` output is out-of-band: it is captured on the execution context
//! and delivered with the result, never through the effect buffer. Lines
//! are also mirrored to `tracing` under the panel and handler fields.

use super::charge;
use crate::context::{LogLevel, SharedContext};
use crate::error::AbiResult;

/// Log a message at the given level (0=debug, 1=info, 2=warn, 3=error).
pub fn log(ctx: &SharedContext, level: i32, message: &str) -> AbiResult<()> {
    charge(ctx, "log")?;
    let mut context = ctx.lock();

    let level = LogLevel::from(level);
    context.push_log(level, message.to_string());

    match level {
        LogLevel::Debug => tracing::debug!(
            panel_id = %context.panel_id,
            handler = %context.handler_name,
            "{}",
            message
        ),
        LogLevel::Info => tracing::info!(
            panel_id = %context.panel_id,
            handler = %context.handler_name,
            "{}",
            message
        ),
        LogLevel::Warn => tracing::warn!(
            panel_id = %context.panel_id,
            handler = %context.handler_name,
            "{}",
            message
        ),
        LogLevel::Error => tracing::error!(
            panel_id = %context.panel_id,
            handler = %context.handler_name,
            "{}",
            message
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionLimits;
    use crate::context::{ExecutionContext, HandlerContext};

    fn shared() -> SharedContext {
        let mut ec =
            ExecutionContext::new(HandlerContext::new("p", "h"), ExecutionLimits::default());
        ec.enforcer.arm();
        ec.into_shared()
    }

    #[test]
    fn test_log_captured_out_of_band() {
        let ctx = shared();

        log(&ctx, 1, "starting").unwrap();
        log(&ctx, 3, "failed").unwrap();

        let mut context = ctx.lock();
        assert!(context.effects.is_empty());

        let logs = context.take_logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(logs[1].level, LogLevel::Error);
        assert_eq!(logs[1].message, "failed");
    }

    #[test]
    fn test_unknown_level_maps_to_info() {
        let ctx = shared();

        log(&ctx, 99, "weird level").unwrap();

        let mut context = ctx.lock();
        assert_eq!(context.take_logs()[0].level, LogLevel::Info);
    }
}
