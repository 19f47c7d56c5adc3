//! # NXML Handler Runtime
//!
//! Sandboxed execution of NXML panel handlers. Handlers are dynamically
//! typed scripts compiled to engine bytecode and run inside a WASM
//! sandbox with strong isolation and bounded resources; everything they
//! do is surfaced to the host as an ordered effect buffer, and async
//! extension calls suspend the instance until the host resolves them.
//!
//! ## Architecture
//!
//! ```text
//! Host (workspace kernel)
//!     │ execute / resume / cancel
//!     ▼
//! Runtime ── compiler cache (memory + disk)
//!     │
//!     ▼
//! Instance pool ── semaphore admission, parked map
//!     │
//!     ▼
//! Instance ── script VM in WASM
//!     │ host ABI (state / events / view / log / time / ext)
//!     ▼
//! Effect buffer → WasmResult
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use nxml_runtime::{HandlerContext, Resolution, Runtime, RuntimeConfig};
//!
//! # async fn run() -> Result<(), nxml_runtime::RuntimeError> {
//! let runtime = Runtime::new(
//!     RuntimeConfig::default().with_engine_module_path("engine/quickjs.wasm"),
//! )?;
//!
//! let compiled = runtime.compile("$state.count = ($state.count || 0) + 1;").await?;
//! let result = runtime
//!     .execute(&compiled, HandlerContext::new("panel-1", "increment"), None)
//!     .await?;
//!
//! if let Some(suspension) = &result.suspension {
//!     // Perform the extension I/O, then:
//!     runtime
//!         .resume(&suspension.suspension_id, Resolution::ok("done".into()))
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod abi;
pub mod capability;
pub mod codec;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod value;

// Re-export the embedding surface
pub use capability::{infer_capabilities, CapabilityChecker, CapabilityToken};
pub use config::{ExecutionLimits, RuntimeConfig};
pub use context::{
    Effect, EmittedEvent, ExecutionStatus, HandlerContext, LogLevel, LogMessage, MutationOp,
    Resolution, StateMutation, SuspensionDetails, ViewCommand, ViewCommandType, WasmResult,
};
pub use engine::binding::{EngineBinding, ScriptVm, VmOutcome};
pub use engine::compiler::CompiledHandler;
pub use engine::{Runtime, ShutdownMode};
pub use error::{ErrorCode, FatalKind, HandlerError, ResourceKind, RuntimeError};
pub use metrics::{ExecutionMetrics, RuntimeStats};
pub use value::RuntimeValue;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
