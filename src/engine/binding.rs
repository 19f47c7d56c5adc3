//! Engine binding seam.
//!
//! An [`EngineBinding`] wraps one script-engine-in-WASM module: it compiles
//! handler source to engine bytecode and creates isolated VMs. A
//! [`ScriptVm`] is one sandbox; it drives the host ABI through the shared
//! execution context and reports how the span ended.
//!
//! The production binding is [`crate::engine::wasm::WasmEngineBinding`].
//! [`crate::engine::scripted::ScriptedBinding`] provides the same contract
//! without the engine module for hosts and tests that exercise runtime
//! semantics only.

use crate::context::{Resolution, SharedContext};
use crate::error::{HandlerError, Result};
use crate::value::RuntimeValue;

/// How an execute/resume span ended
#[derive(Debug, Clone, PartialEq)]
pub enum VmOutcome {
    /// The handler ran to completion
    Completed(Option<RuntimeValue>),
    /// The handler called `ext_suspend`; the suspension is recorded on the
    /// execution context and the VM holds the continuation
    Suspended,
    /// The handler was unwound: uncaught script exception, terminal ABI
    /// fault, memory ceiling, or timeout
    Faulted(HandlerError),
}

/// A single sandboxed VM.
///
/// Control is single-threaded: at most one of `start`/`resume` runs at a
/// time, and between a `Suspended` outcome and the following `resume` the
/// VM simply holds its state (the continuation lives in VM memory, not in
/// any host-side object).
pub trait ScriptVm: Send {
    /// Begin executing compiled handler bytecode against a fresh execution
    /// context.
    fn start(&mut self, bytecode: &[u8], ctx: SharedContext) -> Result<VmOutcome>;

    /// Continue a suspended execution with the host's resolution.
    fn resume(&mut self, resolution: Resolution, ctx: SharedContext) -> Result<VmOutcome>;

    /// Drop script-level globals and pending continuations, keeping the
    /// memory arena for reuse.
    fn reset(&mut self) -> Result<()>;

    /// Linear memory currently in use, in bytes.
    fn memory_used(&self) -> u64;

    /// Peak linear memory over the VM's lifetime, in bytes.
    fn memory_peak(&self) -> u64;
}

/// Factory and compiler for one bundled script engine.
pub trait EngineBinding: Send + Sync {
    /// Engine identity mixed into compile fingerprints. Bytecode produced
    /// under different tags is never interchangeable.
    fn version_tag(&self) -> &str;

    /// Compile handler source to engine bytecode. Deterministic: equal
    /// source yields byte-identical output.
    fn compile(&self, source: &str) -> std::result::Result<Vec<u8>, HandlerError>;

    /// Create a fresh VM honoring the configured memory and stack ceilings.
    fn create_vm(&self) -> Result<Box<dyn ScriptVm>>;
}
