//! Wasmtime-backed engine binding.
//!
//! The bundled script engine is a QuickJS-family interpreter compiled to a
//! core WASM module, loaded from `engine_module_path`. Each VM owns one
//! store instrumented with a memory limiter and epoch-based interruption;
//! the host ABI is registered under the `nxml` import module and the JS
//! bootstrap (which defines `$state`, `$emit`, `$view`, `$ext`, `$log`,
//! `$time`, `$scope` and shadows ambient I/O globals) is installed at VM
//! creation.
//!
//! # Guest ABI
//!
//! The engine module must export:
//! - `memory` — linear memory
//! - `nxml_alloc(len) -> ptr` — guest-side allocation for host writes
//! - `nxml_init(ptr, len) -> status` — install the bootstrap script
//! - `nxml_compile(ptr, len) -> packed` — compile source to bytecode
//! - `nxml_start(code_ptr, code_len, ctx_ptr, ctx_len) -> packed` — begin
//!   executing a handler against a boot context
//! - `nxml_resume(ptr, len) -> packed` — rewind a suspended handler with a
//!   resolution
//! - `nxml_reset() -> status` — drop script globals, keep the arena
//!
//! `packed` is `(ptr << 32) | len` locating a MessagePack envelope in
//! guest memory; zero signals an engine-level failure. Suspension uses an
//! asyncify-style unwind: `ext_suspend` records the suspension host-side
//! and returns, the engine unwinds to the entry point and reports a
//! `suspended` envelope, and `nxml_resume` rewinds the stack so the call
//! site observes the resolution value. The continuation is therefore held
//! entirely by VM memory; cancelling means destroying the VM.

use crate::codec;
use crate::config::RuntimeConfig;
use crate::context::{Resolution, SharedContext};
use crate::engine::binding::{EngineBinding, ScriptVm, VmOutcome};
use crate::error::{AbiFault, HandlerError, Result, RuntimeError};
use crate::value::RuntimeValue;
use crate::{abi, error::status};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use wasmtime::{
    Caller, Config, Engine, Instance as WasmInstance, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, Trap, TypedFunc,
};

/// The embedded bootstrap defining the in-sandbox surface
pub const BOOTSTRAP: &str = include_str!("bootstrap.js");

/// Import module name for the host ABI
const ABI_MODULE: &str = "nxml";

/// Per-store host state reachable from ABI closures
struct VmState {
    ctx: Option<SharedContext>,
    limits: StoreLimits,
    /// Terminal fault recorded before trapping out of a host call
    fault: Option<AbiFault>,
}

/// Boot payload delivered to the guest at `nxml_start`
#[derive(Serialize)]
struct BootContext<'a> {
    state: &'a HashMap<String, RuntimeValue>,
    computed: &'a HashSet<String>,
    args: &'a HashMap<String, RuntimeValue>,
    scope: &'a HashMap<String, RuntimeValue>,
    extensions: &'a HashMap<String, Vec<String>>,
}

/// Result envelope read back from the guest
#[derive(Deserialize)]
struct GuestEnvelope {
    status: String,
    #[serde(default)]
    value: Option<RuntimeValue>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    stack: Option<String>,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    column: Option<u32>,
}

/// Compile envelope read back from `nxml_compile`
#[derive(Deserialize)]
struct CompileEnvelope {
    ok: bool,
    #[serde(default)]
    bytecode: Option<Vec<u8>>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    column: Option<u32>,
}

/// Ticker incrementing the engine epoch so running guests hit their
/// deadline within one yield interval.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl EpochTicker {
    fn spawn(engine: Engine, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("nxml-epoch".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })
            .ok();
        Self { stop, handle }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Wasmtime-backed [`EngineBinding`]
pub struct WasmEngineBinding {
    engine: Engine,
    module: Module,
    version_tag: String,
    memory_limit_bytes: u64,
    yield_interval_ms: u64,
    _ticker: EpochTicker,
}

impl std::fmt::Debug for WasmEngineBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngineBinding")
            .field("version_tag", &self.version_tag)
            .field("memory_limit_bytes", &self.memory_limit_bytes)
            .field("yield_interval_ms", &self.yield_interval_ms)
            .finish()
    }
}

impl WasmEngineBinding {
    /// Load the engine module and start the epoch ticker.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let path = config
            .engine_module_path
            .as_ref()
            .ok_or_else(|| RuntimeError::Engine("engine_module_path not configured".into()))?;

        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        wasm_config.max_wasm_stack(config.stack_size_bytes as usize);

        let engine = Engine::new(&wasm_config)
            .map_err(|e| RuntimeError::Engine(format!("engine init failed: {e}")))?;
        let module = load_module(&engine, path)?;

        info!(module = %path.display(), "loaded script engine module");

        let ticker = EpochTicker::spawn(
            engine.clone(),
            Duration::from_millis(config.yield_interval_ms),
        );

        Ok(Self {
            engine,
            module,
            version_tag: config.engine_version_tag.clone(),
            memory_limit_bytes: config.memory_limit_bytes,
            yield_interval_ms: config.yield_interval_ms,
            _ticker: ticker,
        })
    }

    fn instantiate(&self) -> Result<WasmVm> {
        let limits = StoreLimitsBuilder::new()
            .memory_size(self.memory_limit_bytes as usize)
            .tables(4)
            .table_elements(100_000)
            .build();

        let mut store = Store::new(
            &self.engine,
            VmState {
                ctx: None,
                limits,
                fault: None,
            },
        );
        store.limiter(|state| &mut state.limits);
        store.epoch_deadline_trap();
        // Generous deadline for instantiation and bootstrap installation.
        store.set_epoch_deadline(1_000);

        let mut linker: Linker<VmState> = Linker::new(&self.engine);
        register_abi(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| RuntimeError::Engine(format!("instantiation failed: {e}")))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| RuntimeError::Engine("engine module exports no memory".into()))?;
        let alloc = typed_export::<i32, i32>(&instance, &mut store, "nxml_alloc")?;
        let init = typed_export::<(i32, i32), i32>(&instance, &mut store, "nxml_init")?;
        let compile = typed_export::<(i32, i32), i64>(&instance, &mut store, "nxml_compile")?;
        let start = typed_export::<(i32, i32, i32, i32), i64>(&instance, &mut store, "nxml_start")?;
        let resume = typed_export::<(i32, i32), i64>(&instance, &mut store, "nxml_resume")?;
        let reset = typed_export::<(), i32>(&instance, &mut store, "nxml_reset")?;

        let mut vm = WasmVm {
            store,
            memory,
            alloc,
            compile,
            start,
            resume,
            reset,
            yield_interval_ms: self.yield_interval_ms,
            memory_peak: 0,
        };

        let (ptr, len) = vm.copy_in(BOOTSTRAP.as_bytes())?;
        let rc = vm
            .init_call(init, ptr, len)
            .map_err(|e| RuntimeError::Engine(format!("bootstrap install failed: {e}")))?;
        if rc != status::SUCCESS {
            return Err(RuntimeError::Engine(format!(
                "bootstrap install rejected: status {rc}"
            )));
        }

        vm.note_memory();
        Ok(vm)
    }
}

impl EngineBinding for WasmEngineBinding {
    fn version_tag(&self) -> &str {
        &self.version_tag
    }

    fn compile(&self, source: &str) -> std::result::Result<Vec<u8>, HandlerError> {
        let mut vm = self
            .instantiate()
            .map_err(|e| HandlerError::compile(format!("compiler VM unavailable: {e}")))?;

        let (ptr, len) = vm
            .copy_in(source.as_bytes())
            .map_err(|e| HandlerError::compile(format!("compiler VM write failed: {e}")))?;

        let packed = vm
            .compile_call(ptr, len)
            .map_err(|e| HandlerError::compile(format!("engine compiler failed: {e}")))?;

        let envelope: CompileEnvelope = vm
            .read_envelope(packed)
            .map_err(|e| HandlerError::compile(format!("compiler envelope invalid: {e}")))?;

        if envelope.ok {
            envelope
                .bytecode
                .ok_or_else(|| HandlerError::compile("compiler returned no bytecode"))
        } else {
            let mut err = HandlerError::compile(
                envelope
                    .message
                    .unwrap_or_else(|| "compilation failed".into()),
            );
            if let (Some(line), Some(column)) = (envelope.line, envelope.column) {
                err = err.with_location(line, column);
            }
            Err(err)
        }
    }

    fn create_vm(&self) -> Result<Box<dyn ScriptVm>> {
        Ok(Box::new(self.instantiate()?))
    }
}

/// One engine VM: a store, its instance, and the typed entry points
struct WasmVm {
    store: Store<VmState>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    compile: TypedFunc<(i32, i32), i64>,
    start: TypedFunc<(i32, i32, i32, i32), i64>,
    resume: TypedFunc<(i32, i32), i64>,
    reset: TypedFunc<(), i32>,
    yield_interval_ms: u64,
    memory_peak: u64,
}

impl WasmVm {
    fn copy_in(&mut self, bytes: &[u8]) -> Result<(i32, i32)> {
        let ptr = self
            .alloc
            .call(&mut self.store, bytes.len() as i32)
            .map_err(|e| RuntimeError::Engine(format!("guest alloc failed: {e}")))?;
        let offset = ptr as usize;
        let data = self.memory.data_mut(&mut self.store);
        if offset + bytes.len() > data.len() {
            return Err(RuntimeError::Engine("guest alloc out of bounds".into()));
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok((ptr, bytes.len() as i32))
    }

    fn init_call(&mut self, init: TypedFunc<(i32, i32), i32>, ptr: i32, len: i32) -> anyhow::Result<i32> {
        init.call(&mut self.store, (ptr, len))
    }

    fn compile_call(&mut self, ptr: i32, len: i32) -> anyhow::Result<i64> {
        self.store.set_epoch_deadline(1_000);
        self.compile.call(&mut self.store, (ptr, len))
    }

    fn read_envelope<T: serde::de::DeserializeOwned>(&mut self, packed: i64) -> Result<T> {
        if packed == 0 {
            return Err(RuntimeError::Engine("engine returned null envelope".into()));
        }
        let ptr = (packed as u64 >> 32) as usize;
        let len = (packed as u64 & 0xffff_ffff) as usize;
        let data = self.memory.data(&self.store);
        let slice = data
            .get(ptr..ptr + len)
            .ok_or_else(|| RuntimeError::Engine("envelope out of bounds".into()))?;
        codec::decode(slice)
    }

    fn note_memory(&mut self) {
        let used = self.memory.data_size(&self.store) as u64;
        if used > self.memory_peak {
            self.memory_peak = used;
        }
    }

    /// Program the epoch deadline from the enforcer's remaining budget.
    fn arm_deadline(&mut self, ctx: &SharedContext) {
        let remaining_ms = ctx
            .lock()
            .enforcer
            .remaining_ms()
            .unwrap_or(self.yield_interval_ms);
        let ticks = remaining_ms / self.yield_interval_ms.max(1) + 2;
        self.store.set_epoch_deadline(ticks);
    }

    fn interpret(
        &mut self,
        called: anyhow::Result<i64>,
        ctx: &SharedContext,
    ) -> Result<VmOutcome> {
        self.note_memory();

        if let Some(fault) = self.store.data_mut().fault.take() {
            return Ok(VmOutcome::Faulted(fault.into()));
        }

        let packed = match called {
            Ok(packed) => packed,
            Err(e) => {
                if let Some(trap) = e.downcast_ref::<Trap>() {
                    return Ok(match trap {
                        Trap::Interrupt => {
                            let timeout_ms = ctx.lock().enforcer.limits().timeout_ms;
                            VmOutcome::Faulted(HandlerError::timeout(timeout_ms))
                        }
                        other => VmOutcome::Faulted(HandlerError::execution(format!(
                            "engine trap: {other}"
                        ))),
                    });
                }
                return Err(RuntimeError::Engine(format!("engine call failed: {e}")));
            }
        };

        let envelope: GuestEnvelope = self.read_envelope(packed)?;
        match envelope.status.as_str() {
            "ok" => Ok(VmOutcome::Completed(envelope.value)),
            "suspended" => Ok(VmOutcome::Suspended),
            "oom" => {
                let limit = self.memory.data_size(&self.store) as u64;
                Ok(VmOutcome::Faulted(HandlerError::memory_limit(limit)))
            }
            "error" => {
                let mut err = HandlerError::execution(
                    envelope
                        .message
                        .unwrap_or_else(|| "uncaught script exception".into()),
                );
                if let Some(stack) = envelope.stack {
                    err = err.with_stack(stack);
                }
                if let (Some(line), Some(column)) = (envelope.line, envelope.column) {
                    err = err.with_location(line, column);
                }
                Ok(VmOutcome::Faulted(err))
            }
            other => Err(RuntimeError::Engine(format!(
                "unknown envelope status '{other}'"
            ))),
        }
    }
}

impl ScriptVm for WasmVm {
    fn start(&mut self, bytecode: &[u8], ctx: SharedContext) -> Result<VmOutcome> {
        let boot = {
            let context = ctx.lock();
            codec::encode(&BootContext {
                state: &context.state,
                computed: &context.computed_keys,
                args: &context.args,
                scope: &context.scope,
                extensions: &context.extension_registry,
            })?
        };

        self.store.data_mut().ctx = Some(ctx.clone());
        self.store.data_mut().fault = None;
        self.arm_deadline(&ctx);

        let (code_ptr, code_len) = self.copy_in(bytecode)?;
        let (ctx_ptr, ctx_len) = self.copy_in(&boot)?;
        let called = self
            .start
            .call(&mut self.store, (code_ptr, code_len, ctx_ptr, ctx_len));

        self.interpret(called, &ctx)
    }

    fn resume(&mut self, resolution: Resolution, ctx: SharedContext) -> Result<VmOutcome> {
        let payload = codec::encode(&resolution)?;

        self.store.data_mut().ctx = Some(ctx.clone());
        self.store.data_mut().fault = None;
        self.arm_deadline(&ctx);

        let (ptr, len) = self.copy_in(&payload)?;
        let called = self.resume.call(&mut self.store, (ptr, len));

        self.interpret(called, &ctx)
    }

    fn reset(&mut self) -> Result<()> {
        self.store.data_mut().ctx = None;
        self.store.data_mut().fault = None;
        self.store.set_epoch_deadline(1_000);
        let rc = self
            .reset
            .call(&mut self.store, ())
            .map_err(|e| RuntimeError::Engine(format!("engine reset failed: {e}")))?;
        if rc != status::SUCCESS {
            return Err(RuntimeError::Engine(format!(
                "engine reset rejected: status {rc}"
            )));
        }
        Ok(())
    }

    fn memory_used(&self) -> u64 {
        self.memory.data_size(&self.store) as u64
    }

    fn memory_peak(&self) -> u64 {
        self.memory_peak.max(self.memory_used())
    }
}

fn load_module(engine: &Engine, path: &Path) -> Result<Module> {
    let bytes = std::fs::read(path)?;
    Module::new(engine, &bytes)
        .map_err(|e| RuntimeError::Engine(format!("engine module invalid: {e}")))
}

fn typed_export<Params, Results>(
    instance: &WasmInstance,
    store: &mut Store<VmState>,
    name: &str,
) -> Result<TypedFunc<Params, Results>>
where
    Params: wasmtime::WasmParams,
    Results: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<Params, Results>(&mut *store, name)
        .map_err(|e| RuntimeError::Engine(format!("missing engine export '{name}': {e}")))
}

/// Shared handling for ABI entries: run the host-side call, translate
/// faults. Terminal faults are recorded in the store and trap the guest so
/// the instance unwinds; script-visible faults become negative status
/// codes the bootstrap re-raises as catchable exceptions.
fn dispatch_status(
    caller: &mut Caller<'_, VmState>,
    run: impl FnOnce(&SharedContext) -> crate::error::AbiResult<()>,
) -> anyhow::Result<i32> {
    let ctx = match caller.data().ctx.clone() {
        Some(ctx) => ctx,
        None => return Ok(status::INVALID_ARGUMENT),
    };

    match run(&ctx) {
        Ok(()) => Ok(status::SUCCESS),
        Err(fault) if fault.is_terminal() => {
            let code = fault.status_code();
            caller.data_mut().fault = Some(fault);
            Err(anyhow!("terminal abi fault: status {code}"))
        }
        Err(fault) => Ok(fault.status_code()),
    }
}

/// Like [`dispatch_status`] for entries that hand a buffer back to the
/// guest; returns a packed `(ptr << 32) | len` or zero on failure.
fn dispatch_packed(
    caller: &mut Caller<'_, VmState>,
    run: impl FnOnce(&SharedContext) -> crate::error::AbiResult<Vec<u8>>,
) -> anyhow::Result<i64> {
    let ctx = match caller.data().ctx.clone() {
        Some(ctx) => ctx,
        None => return Ok(0),
    };

    match run(&ctx) {
        Ok(bytes) => write_to_guest(caller, &bytes),
        Err(fault) if fault.is_terminal() => {
            let code = fault.status_code();
            caller.data_mut().fault = Some(fault);
            Err(anyhow!("terminal abi fault: status {code}"))
        }
        Err(fault) => {
            debug!(fault = %fault, "abi call failed");
            Ok(0)
        }
    }
}

fn guest_memory(caller: &mut Caller<'_, VmState>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow!("guest memory not exported"))
}

fn read_guest(caller: &mut Caller<'_, VmState>, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let data = memory.data(&caller);
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| anyhow!("guest buffer overflow"))?;
    data.get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow!("guest buffer out of bounds"))
}

fn read_guest_str(caller: &mut Caller<'_, VmState>, ptr: i32, len: i32) -> anyhow::Result<String> {
    String::from_utf8(read_guest(caller, ptr, len)?).map_err(|e| anyhow!("non-utf8 string: {e}"))
}

fn read_guest_value(
    caller: &mut Caller<'_, VmState>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<RuntimeValue> {
    let bytes = read_guest(caller, ptr, len)?;
    codec::decode_value(&bytes).map_err(|e| anyhow!("value decode failed: {e}"))
}

fn write_to_guest(caller: &mut Caller<'_, VmState>, bytes: &[u8]) -> anyhow::Result<i64> {
    let memory = guest_memory(caller)?;
    let alloc = caller
        .get_export("nxml_alloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| anyhow!("guest allocator not exported"))?
        .typed::<i32, i32>(&caller)?;

    let ptr = alloc.call(&mut *caller, bytes.len() as i32)?;
    let offset = ptr as usize;
    let data = memory.data_mut(&mut *caller);
    let end = offset
        .checked_add(bytes.len())
        .ok_or_else(|| anyhow!("guest buffer overflow"))?;
    if end > data.len() {
        return Err(anyhow!("guest alloc out of bounds"));
    }
    data[offset..end].copy_from_slice(bytes);

    Ok(((ptr as u64) << 32 | bytes.len() as u64) as i64)
}

fn encode_for_guest<T: serde::Serialize>(value: &T) -> crate::error::AbiResult<Vec<u8>> {
    codec::encode(value).map_err(|e| AbiFault::Codec(e.to_string()))
}

/// Register every host ABI function under the `nxml` import module.
fn register_abi(linker: &mut Linker<VmState>) -> Result<()> {
    let wire = |e: anyhow::Error| RuntimeError::Engine(format!("abi registration failed: {e}"));

    linker
        .func_wrap(
            ABI_MODULE,
            "state_get",
            |mut caller: Caller<'_, VmState>, key_ptr: i32, key_len: i32| -> anyhow::Result<i64> {
                let key = read_guest_str(&mut caller, key_ptr, key_len)?;
                dispatch_packed(&mut caller, |ctx| {
                    let value = abi::state::get(ctx, &key)?;
                    encode_for_guest(&value)
                })
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "state_set",
            |mut caller: Caller<'_, VmState>,
             key_ptr: i32,
             key_len: i32,
             val_ptr: i32,
             val_len: i32|
             -> anyhow::Result<i32> {
                let key = read_guest_str(&mut caller, key_ptr, key_len)?;
                let value = read_guest_value(&mut caller, val_ptr, val_len)?;
                dispatch_status(&mut caller, |ctx| abi::state::set(ctx, &key, value))
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "state_delete",
            |mut caller: Caller<'_, VmState>, key_ptr: i32, key_len: i32| -> anyhow::Result<i32> {
                let key = read_guest_str(&mut caller, key_ptr, key_len)?;
                dispatch_status(&mut caller, |ctx| abi::state::delete(ctx, &key))
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "state_has",
            |mut caller: Caller<'_, VmState>, key_ptr: i32, key_len: i32| -> anyhow::Result<i32> {
                let key = read_guest_str(&mut caller, key_ptr, key_len)?;
                let ctx = match caller.data().ctx.clone() {
                    Some(ctx) => ctx,
                    None => return Ok(status::INVALID_ARGUMENT),
                };
                match abi::state::has(&ctx, &key) {
                    Ok(present) => Ok(i32::from(present)),
                    Err(fault) if fault.is_terminal() => {
                        let code = fault.status_code();
                        caller.data_mut().fault = Some(fault);
                        Err(anyhow!("terminal abi fault: status {code}"))
                    }
                    Err(fault) => Ok(fault.status_code()),
                }
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "state_keys",
            |mut caller: Caller<'_, VmState>| -> anyhow::Result<i64> {
                dispatch_packed(&mut caller, |ctx| {
                    let keys = abi::state::keys(ctx)?;
                    encode_for_guest(&keys)
                })
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "emit",
            |mut caller: Caller<'_, VmState>,
             name_ptr: i32,
             name_len: i32,
             payload_ptr: i32,
             payload_len: i32|
             -> anyhow::Result<i32> {
                let name = read_guest_str(&mut caller, name_ptr, name_len)?;
                let payload = read_guest_value(&mut caller, payload_ptr, payload_len)?;
                dispatch_status(&mut caller, |ctx| abi::events::emit(ctx, &name, payload))
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "view_set_filter",
            |mut caller: Caller<'_, VmState>,
             id_ptr: i32,
             id_len: i32,
             val_ptr: i32,
             val_len: i32|
             -> anyhow::Result<i32> {
                let id = read_guest_str(&mut caller, id_ptr, id_len)?;
                let value = read_guest_value(&mut caller, val_ptr, val_len)?;
                dispatch_status(&mut caller, |ctx| abi::view::set_filter(ctx, &id, value))
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "view_scroll_to",
            |mut caller: Caller<'_, VmState>,
             id_ptr: i32,
             id_len: i32,
             pos_ptr: i32,
             pos_len: i32|
             -> anyhow::Result<i32> {
                let id = read_guest_str(&mut caller, id_ptr, id_len)?;
                let position = read_guest_value(&mut caller, pos_ptr, pos_len)?;
                dispatch_status(&mut caller, |ctx| abi::view::scroll_to(ctx, &id, position))
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "view_focus",
            |mut caller: Caller<'_, VmState>, id_ptr: i32, id_len: i32| -> anyhow::Result<i32> {
                let id = read_guest_str(&mut caller, id_ptr, id_len)?;
                dispatch_status(&mut caller, |ctx| abi::view::focus(ctx, &id))
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "view_command",
            |mut caller: Caller<'_, VmState>,
             id_ptr: i32,
             id_len: i32,
             name_ptr: i32,
             name_len: i32,
             args_ptr: i32,
             args_len: i32|
             -> anyhow::Result<i32> {
                let id = if id_len == 0 {
                    None
                } else {
                    Some(read_guest_str(&mut caller, id_ptr, id_len)?)
                };
                let name = read_guest_str(&mut caller, name_ptr, name_len)?;
                let args = read_guest_value(&mut caller, args_ptr, args_len)?;
                let args = match args {
                    RuntimeValue::Map(map) => map,
                    RuntimeValue::Null => HashMap::new(),
                    _ => return Ok(status::INVALID_ARGUMENT),
                };
                dispatch_status(&mut caller, |ctx| {
                    abi::view::command(ctx, id.as_deref(), &name, args)
                })
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "log",
            |mut caller: Caller<'_, VmState>,
             level: i32,
             msg_ptr: i32,
             msg_len: i32|
             -> anyhow::Result<i32> {
                let message = read_guest_str(&mut caller, msg_ptr, msg_len)?;
                dispatch_status(&mut caller, |ctx| abi::logging::log(ctx, level, &message))
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "now",
            |mut caller: Caller<'_, VmState>| -> anyhow::Result<i64> {
                let ctx = match caller.data().ctx.clone() {
                    Some(ctx) => ctx,
                    None => return Ok(0),
                };
                match abi::time::now(&ctx) {
                    Ok(ms) => Ok(ms),
                    Err(fault) if fault.is_terminal() => {
                        let code = fault.status_code();
                        caller.data_mut().fault = Some(fault);
                        Err(anyhow!("terminal abi fault: status {code}"))
                    }
                    Err(_) => Ok(0),
                }
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "ext_exists",
            |mut caller: Caller<'_, VmState>, name_ptr: i32, name_len: i32| -> anyhow::Result<i32> {
                let name = read_guest_str(&mut caller, name_ptr, name_len)?;
                let ctx = match caller.data().ctx.clone() {
                    Some(ctx) => ctx,
                    None => return Ok(status::INVALID_ARGUMENT),
                };
                match abi::extension::exists(&ctx, &name) {
                    Ok(present) => Ok(i32::from(present)),
                    Err(fault) if fault.is_terminal() => {
                        let code = fault.status_code();
                        caller.data_mut().fault = Some(fault);
                        Err(anyhow!("terminal abi fault: status {code}"))
                    }
                    Err(fault) => Ok(fault.status_code()),
                }
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "ext_methods",
            |mut caller: Caller<'_, VmState>, name_ptr: i32, name_len: i32| -> anyhow::Result<i64> {
                let name = read_guest_str(&mut caller, name_ptr, name_len)?;
                dispatch_packed(&mut caller, |ctx| {
                    let methods = abi::extension::methods(ctx, &name)?;
                    encode_for_guest(&methods)
                })
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "ext_list",
            |mut caller: Caller<'_, VmState>| -> anyhow::Result<i64> {
                dispatch_packed(&mut caller, |ctx| {
                    let extensions = abi::extension::list(ctx)?;
                    encode_for_guest(&extensions)
                })
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "ext_suspend",
            |mut caller: Caller<'_, VmState>,
             name_ptr: i32,
             name_len: i32,
             method_ptr: i32,
             method_len: i32,
             args_ptr: i32,
             args_len: i32|
             -> anyhow::Result<i32> {
                let name = read_guest_str(&mut caller, name_ptr, name_len)?;
                let method = read_guest_str(&mut caller, method_ptr, method_len)?;
                let args = read_guest_value(&mut caller, args_ptr, args_len)?;
                let args = match args {
                    RuntimeValue::List(items) => items,
                    RuntimeValue::Null => Vec::new(),
                    _ => return Ok(status::INVALID_ARGUMENT),
                };
                dispatch_status(&mut caller, |ctx| {
                    abi::extension::suspend(ctx, &name, &method, args).map(|_| ())
                })
            },
        )
        .map_err(wire)?;

    linker
        .func_wrap(
            ABI_MODULE,
            "yield_check",
            |mut caller: Caller<'_, VmState>| -> anyhow::Result<i32> {
                let ctx = match caller.data().ctx.clone() {
                    Some(ctx) => ctx,
                    None => return Ok(status::SUCCESS),
                };
                match abi::yield_check(&ctx) {
                    Ok(()) => Ok(status::SUCCESS),
                    Err(fault) => {
                        let code = fault.status_code();
                        caller.data_mut().fault = Some(fault);
                        Err(anyhow!("terminal abi fault: status {code}"))
                    }
                }
            },
        )
        .map_err(wire)?;

    Ok(())
}
