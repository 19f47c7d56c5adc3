//! Deterministic scripted engine binding.
//!
//! This binding fulfills the [`EngineBinding`] contract without the script
//! engine WASM module. A "handler" is a JSON array of ABI operations; the
//! VM replays them against the real host ABI, suspending, faulting, and
//! completing exactly where a scripted engine would. It is not a script
//! interpreter: there are no expressions, only ABI traffic.
//!
//! It exists for hosts and CI environments that exercise runtime semantics
//! (pool accounting, suspend/resume, resource enforcement, effect
//! delivery) without shipping the engine module, and it backs this crate's
//! own test suite.

use crate::abi;
use crate::codec;
use crate::context::{Resolution, SharedContext};
use crate::engine::binding::{EngineBinding, ScriptVm, VmOutcome};
use crate::error::{AbiFault, HandlerError, Result, RuntimeError};
use crate::value::RuntimeValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Simulated arena overhead per VM
const BASE_MEMORY_BYTES: u64 = 256 * 1024;

/// One scripted ABI operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ScriptOp {
    /// Read a state key into the value register
    StateGet {
        /// State key
        key: String,
    },
    /// Write a state key
    StateSet {
        /// State key
        key: String,
        /// Value to write
        value: RuntimeValue,
    },
    /// Write the value register (optionally a path within it) to a state key
    StateSetFromLast {
        /// State key
        key: String,
        /// Dotted path into the register value
        #[serde(default)]
        path: Option<String>,
    },
    /// Write a state key, catching script-visible faults into the register
    TryStateSet {
        /// State key
        key: String,
        /// Value to write
        value: RuntimeValue,
    },
    /// Delete a state key
    StateDelete {
        /// State key
        key: String,
    },
    /// Emit an event
    Emit {
        /// Event name
        name: String,
        /// Event payload
        payload: RuntimeValue,
    },
    /// Set a view filter
    ViewFilter {
        /// Target component
        component: String,
        /// Filter value
        value: RuntimeValue,
    },
    /// Scroll a component
    ViewScroll {
        /// Target component
        component: String,
        /// Scroll position
        position: RuntimeValue,
    },
    /// Focus a component
    ViewFocus {
        /// Target component
        component: String,
    },
    /// Send a custom view command
    ViewCommand {
        /// Target component
        #[serde(default)]
        component: Option<String>,
        /// Command name
        name: String,
        /// Command arguments
        #[serde(default)]
        args: HashMap<String, RuntimeValue>,
    },
    /// Log a message
    Log {
        /// Level (0-3)
        level: i32,
        /// Message
        message: String,
    },
    /// Read the host clock into the value register
    Now,
    /// Read an argument into the value register
    ArgGet {
        /// Argument name
        name: String,
    },
    /// Read a scope variable into the value register
    ScopeGet {
        /// Scope variable name
        name: String,
    },
    /// Call an async extension method (suspends the VM)
    ExtCall {
        /// Extension name
        extension: String,
        /// Method name
        method: String,
        /// Call arguments
        #[serde(default)]
        args: Vec<RuntimeValue>,
        /// Whether an error resolution is caught into the register instead
        /// of unwinding
        #[serde(default)]
        catch: bool,
    },
    /// Write `prefix0..prefixN-1` state keys (bulk mutation loop)
    SetLoop {
        /// Key prefix
        prefix: String,
        /// Iteration count
        count: u32,
    },
    /// Busy-loop at yield points until interrupted
    Spin,
    /// Grow the simulated memory arena
    GrowMemory {
        /// Bytes to grow by
        bytes: u64,
    },
    /// Throw an uncaught script exception
    Throw {
        /// Exception message
        message: String,
    },
    /// Complete with a literal value
    ReturnValue {
        /// Return value
        value: RuntimeValue,
    },
    /// Complete with the value register (optionally a path within it)
    ReturnLast {
        /// Dotted path into the register value
        #[serde(default)]
        path: Option<String>,
    },
}

/// Deterministic engine binding over [`ScriptOp`] programs
pub struct ScriptedBinding {
    memory_limit_bytes: u64,
}

impl ScriptedBinding {
    /// Create a binding with the default memory ceiling
    pub fn new() -> Self {
        Self {
            memory_limit_bytes: 32 * 1024 * 1024,
        }
    }

    /// Create a binding with an explicit memory ceiling
    pub fn with_memory_limit(memory_limit_bytes: u64) -> Self {
        Self { memory_limit_bytes }
    }
}

impl Default for ScriptedBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBinding for ScriptedBinding {
    fn version_tag(&self) -> &str {
        "scripted-v1"
    }

    fn compile(&self, source: &str) -> std::result::Result<Vec<u8>, HandlerError> {
        let ops: Vec<ScriptOp> = serde_json::from_str(source).map_err(|e| {
            HandlerError::compile(format!("invalid handler program: {}", e))
                .with_location(e.line() as u32, e.column() as u32)
        })?;

        codec::encode(&ops)
            .map_err(|e| HandlerError::compile(format!("program encoding failed: {}", e)))
    }

    fn create_vm(&self) -> Result<Box<dyn ScriptVm>> {
        Ok(Box::new(ScriptedVm {
            memory_limit_bytes: self.memory_limit_bytes,
            memory_used: BASE_MEMORY_BYTES,
            memory_peak: BASE_MEMORY_BYTES,
            frame: None,
        }))
    }
}

struct Frame {
    ops: Vec<ScriptOp>,
    pc: usize,
    last: RuntimeValue,
    pending_catch: bool,
}

/// VM replaying a [`ScriptOp`] program against the host ABI
struct ScriptedVm {
    memory_limit_bytes: u64,
    memory_used: u64,
    memory_peak: u64,
    frame: Option<Frame>,
}

impl ScriptedVm {
    fn run(&mut self, ctx: &SharedContext) -> Result<VmOutcome> {
        loop {
            let (op, pc) = {
                let frame = self
                    .frame
                    .as_ref()
                    .ok_or_else(|| RuntimeError::Instance("no active frame".into()))?;
                match frame.ops.get(frame.pc) {
                    Some(op) => (op.clone(), frame.pc),
                    None => {
                        self.frame = None;
                        return Ok(VmOutcome::Completed(None));
                    }
                }
            };

            match self.step(ctx, op, pc)? {
                StepResult::Continue => {
                    if let Some(frame) = self.frame.as_mut() {
                        frame.pc = pc + 1;
                    }
                }
                StepResult::Outcome(outcome) => {
                    if !matches!(outcome, VmOutcome::Suspended) {
                        self.frame = None;
                    }
                    return Ok(outcome);
                }
            }
        }
    }

    fn step(&mut self, ctx: &SharedContext, op: ScriptOp, pc: usize) -> Result<StepResult> {
        let result = match op {
            ScriptOp::StateGet { key } => abi::state::get(ctx, &key).map(|value| {
                self.set_last(value.unwrap_or(RuntimeValue::Null));
            }),
            ScriptOp::StateSet { key, value } => abi::state::set(ctx, &key, value),
            ScriptOp::StateSetFromLast { key, path } => {
                let value = self.last_value(path.as_deref());
                abi::state::set(ctx, &key, value)
            }
            ScriptOp::TryStateSet { key, value } => match abi::state::set(ctx, &key, value) {
                Ok(()) => Ok(()),
                Err(fault) if !fault.is_terminal() => {
                    // Script-level catch: the exception message becomes the
                    // register value and execution continues.
                    self.set_last(RuntimeValue::from(fault.to_string()));
                    Ok(())
                }
                Err(fault) => Err(fault),
            },
            ScriptOp::StateDelete { key } => abi::state::delete(ctx, &key),
            ScriptOp::Emit { name, payload } => abi::events::emit(ctx, &name, payload),
            ScriptOp::ViewFilter { component, value } => {
                abi::view::set_filter(ctx, &component, value)
            }
            ScriptOp::ViewScroll {
                component,
                position,
            } => abi::view::scroll_to(ctx, &component, position),
            ScriptOp::ViewFocus { component } => abi::view::focus(ctx, &component),
            ScriptOp::ViewCommand {
                component,
                name,
                args,
            } => abi::view::command(ctx, component.as_deref(), &name, args),
            ScriptOp::Log { level, message } => abi::logging::log(ctx, level, &message),
            ScriptOp::Now => abi::time::now(ctx).map(|ms| self.set_last(RuntimeValue::Int(ms))),
            ScriptOp::ArgGet { name } => {
                let value = ctx
                    .lock()
                    .args
                    .get(&name)
                    .cloned()
                    .unwrap_or(RuntimeValue::Null);
                self.set_last(value);
                Ok(())
            }
            ScriptOp::ScopeGet { name } => {
                let value = ctx
                    .lock()
                    .scope
                    .get(&name)
                    .cloned()
                    .unwrap_or(RuntimeValue::Null);
                self.set_last(value);
                Ok(())
            }
            ScriptOp::ExtCall {
                extension,
                method,
                args,
                catch,
            } => {
                return match abi::extension::suspend(ctx, &extension, &method, args) {
                    Ok(_details) => {
                        if let Some(frame) = self.frame.as_mut() {
                            frame.pc = pc + 1;
                            frame.pending_catch = catch;
                        }
                        Ok(StepResult::Outcome(VmOutcome::Suspended))
                    }
                    Err(fault) => Ok(StepResult::Outcome(self.fault_outcome(fault))),
                };
            }
            ScriptOp::SetLoop { prefix, count } => {
                let mut result = Ok(());
                for i in 0..count {
                    let key = format!("{}{}", prefix, i);
                    if let Err(fault) = abi::state::set(ctx, &key, RuntimeValue::Int(i as i64)) {
                        result = Err(fault);
                        break;
                    }
                }
                result
            }
            ScriptOp::Spin => loop {
                if let Err(fault) = abi::yield_check(ctx) {
                    break Err(fault);
                }
                std::thread::sleep(Duration::from_micros(200));
            },
            ScriptOp::GrowMemory { bytes } => {
                self.memory_used += bytes;
                if self.memory_used > self.memory_peak {
                    self.memory_peak = self.memory_used;
                }
                if self.memory_used > self.memory_limit_bytes {
                    return Ok(StepResult::Outcome(VmOutcome::Faulted(
                        HandlerError::memory_limit(self.memory_limit_bytes),
                    )));
                }
                Ok(())
            }
            ScriptOp::Throw { message } => {
                return Ok(StepResult::Outcome(VmOutcome::Faulted(
                    HandlerError::execution(message),
                )));
            }
            ScriptOp::ReturnValue { value } => {
                return Ok(StepResult::Outcome(VmOutcome::Completed(Some(value))));
            }
            ScriptOp::ReturnLast { path } => {
                let value = self.last_value(path.as_deref());
                return Ok(StepResult::Outcome(VmOutcome::Completed(Some(value))));
            }
        };

        match result {
            Ok(()) => Ok(StepResult::Continue),
            Err(fault) => Ok(StepResult::Outcome(self.fault_outcome(fault))),
        }
    }

    fn fault_outcome(&self, fault: AbiFault) -> VmOutcome {
        // Terminal faults unwind with their own code; script-visible faults
        // surface as an uncaught exception when nothing catches them.
        VmOutcome::Faulted(fault.into())
    }

    fn set_last(&mut self, value: RuntimeValue) {
        if let Some(frame) = self.frame.as_mut() {
            frame.last = value;
        }
    }

    fn last_value(&self, path: Option<&str>) -> RuntimeValue {
        let last = self
            .frame
            .as_ref()
            .map(|f| f.last.clone())
            .unwrap_or(RuntimeValue::Null);
        match path {
            Some(path) => pluck(&last, path),
            None => last,
        }
    }
}

enum StepResult {
    Continue,
    Outcome(VmOutcome),
}

fn pluck(value: &RuntimeValue, path: &str) -> RuntimeValue {
    let mut current = value;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return RuntimeValue::Null,
        }
    }
    current.clone()
}

impl ScriptVm for ScriptedVm {
    fn start(&mut self, bytecode: &[u8], ctx: SharedContext) -> Result<VmOutcome> {
        let ops: Vec<ScriptOp> = codec::decode(bytecode)?;
        self.frame = Some(Frame {
            ops,
            pc: 0,
            last: RuntimeValue::Null,
            pending_catch: false,
        });
        self.run(&ctx)
    }

    fn resume(&mut self, resolution: Resolution, ctx: SharedContext) -> Result<VmOutcome> {
        let pending_catch = self
            .frame
            .as_ref()
            .map(|f| f.pending_catch)
            .unwrap_or(false);

        match resolution {
            Resolution::Ok { value } => self.set_last(value),
            Resolution::Err { message } => {
                if pending_catch {
                    self.set_last(RuntimeValue::from(message));
                } else {
                    self.frame = None;
                    return Ok(VmOutcome::Faulted(HandlerError::execution(message)));
                }
            }
        }

        if let Some(frame) = self.frame.as_mut() {
            frame.pending_catch = false;
        }
        self.run(&ctx)
    }

    fn reset(&mut self) -> Result<()> {
        self.frame = None;
        self.memory_used = BASE_MEMORY_BYTES;
        Ok(())
    }

    fn memory_used(&self) -> u64 {
        self.memory_used
    }

    fn memory_peak(&self) -> u64 {
        self.memory_peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionLimits;
    use crate::context::{Effect, ExecutionContext, HandlerContext};
    use crate::error::ErrorCode;
    use std::collections::HashMap;

    fn shared(hctx: HandlerContext, limits: ExecutionLimits) -> SharedContext {
        let mut ec = ExecutionContext::new(hctx, limits);
        ec.enforcer.arm();
        ec.into_shared()
    }

    fn compile(binding: &ScriptedBinding, program: &str) -> Vec<u8> {
        binding.compile(program).expect("compile")
    }

    #[test]
    fn test_program_runs_and_returns() {
        let binding = ScriptedBinding::new();
        let bytecode = compile(
            &binding,
            r#"[
                {"op":"stateSet","key":"x","value":1},
                {"op":"emit","name":"toast","payload":"hi"},
                {"op":"returnValue","value":42}
            ]"#,
        );

        let ctx = shared(HandlerContext::new("p", "h"), ExecutionLimits::default());
        let mut vm = binding.create_vm().unwrap();
        let outcome = vm.start(&bytecode, ctx.clone()).unwrap();

        assert_eq!(outcome, VmOutcome::Completed(Some(RuntimeValue::Int(42))));
        assert_eq!(ctx.lock().effects.len(), 2);
        assert!(matches!(&ctx.lock().effects[0], Effect::State(_)));
    }

    #[test]
    fn test_compile_error_has_location() {
        let binding = ScriptedBinding::new();
        let err = binding.compile("[{\"op\":").expect_err("must fail");

        assert_eq!(err.code, ErrorCode::CompileError);
        assert!(err.location.is_some());
    }

    #[test]
    fn test_ext_call_suspends_and_resumes() {
        let binding = ScriptedBinding::new();
        let bytecode = compile(
            &binding,
            r#"[
                {"op":"extCall","extension":"http","method":"get","args":["u"]},
                {"op":"stateSetFromLast","key":"s","path":"status"},
                {"op":"returnLast","path":"status"}
            ]"#,
        );

        let mut registry = HashMap::new();
        registry.insert("http".to_string(), vec!["get".to_string()]);
        let ctx = shared(
            HandlerContext::new("p", "h").with_extensions(registry),
            ExecutionLimits::default(),
        );

        let mut vm = binding.create_vm().unwrap();
        assert_eq!(vm.start(&bytecode, ctx.clone()).unwrap(), VmOutcome::Suspended);
        assert!(ctx.lock().suspension.is_some());

        let mut payload = HashMap::new();
        payload.insert("status".to_string(), RuntimeValue::from("ok"));
        let outcome = vm
            .resume(Resolution::ok(RuntimeValue::Map(payload)), ctx.clone())
            .unwrap();

        assert_eq!(
            outcome,
            VmOutcome::Completed(Some(RuntimeValue::from("ok")))
        );
    }

    #[test]
    fn test_uncaught_resolution_error_faults() {
        let binding = ScriptedBinding::new();
        let bytecode = compile(
            &binding,
            r#"[{"op":"extCall","extension":"http","method":"get","args":[]}]"#,
        );

        let mut registry = HashMap::new();
        registry.insert("http".to_string(), vec!["get".to_string()]);
        let ctx = shared(
            HandlerContext::new("p", "h").with_extensions(registry),
            ExecutionLimits::default(),
        );

        let mut vm = binding.create_vm().unwrap();
        vm.start(&bytecode, ctx.clone()).unwrap();

        let outcome = vm.resume(Resolution::err("boom"), ctx).unwrap();
        let VmOutcome::Faulted(err) = outcome else {
            panic!("expected fault");
        };
        assert_eq!(err.code, ErrorCode::ExecutionError);
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn test_caught_resolution_error_continues() {
        let binding = ScriptedBinding::new();
        let bytecode = compile(
            &binding,
            r#"[
                {"op":"extCall","extension":"http","method":"get","args":[],"catch":true},
                {"op":"returnValue","value":"recovered"}
            ]"#,
        );

        let mut registry = HashMap::new();
        registry.insert("http".to_string(), vec!["get".to_string()]);
        let ctx = shared(
            HandlerContext::new("p", "h").with_extensions(registry),
            ExecutionLimits::default(),
        );

        let mut vm = binding.create_vm().unwrap();
        vm.start(&bytecode, ctx.clone()).unwrap();

        let outcome = vm.resume(Resolution::err("boom"), ctx).unwrap();
        assert_eq!(
            outcome,
            VmOutcome::Completed(Some(RuntimeValue::from("recovered")))
        );
    }

    #[test]
    fn test_memory_growth_faults_at_ceiling() {
        let binding = ScriptedBinding::with_memory_limit(1024 * 1024);
        let bytecode = compile(&binding, r#"[{"op":"growMemory","bytes":2097152}]"#);

        let ctx = shared(HandlerContext::new("p", "h"), ExecutionLimits::default());
        let mut vm = binding.create_vm().unwrap();

        let VmOutcome::Faulted(err) = vm.start(&bytecode, ctx).unwrap() else {
            panic!("expected fault");
        };
        assert_eq!(err.code, ErrorCode::MemoryLimit);
        assert!(vm.memory_peak() > 1024 * 1024);
    }

    #[test]
    fn test_reset_clears_frame_and_arena() {
        let binding = ScriptedBinding::new();
        let bytecode = compile(&binding, r#"[{"op":"growMemory","bytes":1024}]"#);

        let ctx = shared(HandlerContext::new("p", "h"), ExecutionLimits::default());
        let mut vm = binding.create_vm().unwrap();
        vm.start(&bytecode, ctx).unwrap();
        assert!(vm.memory_used() > BASE_MEMORY_BYTES);

        vm.reset().unwrap();
        assert_eq!(vm.memory_used(), BASE_MEMORY_BYTES);
    }
}
