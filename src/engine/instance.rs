//! Instance management.
//!
//! An [`Instance`] is one prepared sandbox: a script VM, the execution
//! context shared with the host ABI, and the suspension slot. Its
//! lifecycle is idle → running → (parked ↔ running)* → idle | terminated.
//! Effects are drained out of the context at every boundary crossing, so a
//! suspended result already carries everything produced before the
//! suspension and nothing is re-delivered later.

use crate::config::ExecutionLimits;
use crate::context::{
    ExecutionContext, HandlerContext, Resolution, SharedContext, SuspensionDetails, WasmResult,
};
use crate::engine::binding::{ScriptVm, VmOutcome};
use crate::engine::compiler::CompiledHandler;
use crate::engine::limits::ResumeBudget;
use crate::error::{Result, RuntimeError};
use crate::metrics::ExecutionMetrics;
use crate::value::RuntimeValue;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Unique instance ID
pub type InstanceId = String;

/// Instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Reset and reusable
    Idle,
    /// Currently executing
    Running,
    /// Suspended awaiting a host resolution; holds memory and its permit
    Parked,
    /// Released; never reused
    Terminated,
}

/// A single sandbox instance
pub struct Instance {
    id: InstanceId,
    state: InstanceState,
    vm: Box<dyn ScriptVm>,
    ctx: Option<SharedContext>,
    suspension_id: Option<String>,
    executions: u64,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("suspension_id", &self.suspension_id)
            .field("executions", &self.executions)
            .finish()
    }
}

impl Instance {
    /// Wrap a fresh VM into an idle instance
    pub fn new(vm: Box<dyn ScriptVm>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: InstanceState::Idle,
            vm,
            ctx: None,
            suspension_id: None,
            executions: 0,
        }
    }

    /// Instance ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Linear memory currently in use
    pub fn memory_used(&self) -> u64 {
        self.vm.memory_used()
    }

    /// Peak linear memory over the instance lifetime
    pub fn memory_peak(&self) -> u64 {
        self.vm.memory_peak()
    }

    /// Suspension ID while parked
    pub fn suspension_id(&self) -> Option<&str> {
        self.suspension_id.as_deref()
    }

    /// Executions started on this instance
    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// Execute a compiled handler.
    ///
    /// Returns the boundary-crossing result; `Err` is reserved for host
    /// bugs (wrong lifecycle state, VM plumbing failures), after which the
    /// instance is terminated.
    pub fn execute(
        &mut self,
        compiled: &CompiledHandler,
        hctx: HandlerContext,
        limits: ExecutionLimits,
    ) -> Result<WasmResult> {
        if self.state != InstanceState::Idle {
            return Err(RuntimeError::Instance(format!(
                "execute on non-idle instance ({:?})",
                self.state
            )));
        }

        self.state = InstanceState::Running;
        self.executions += 1;

        let mut context = ExecutionContext::new(hctx, limits);
        context.enforcer.arm();
        let shared = context.into_shared();
        self.ctx = Some(shared.clone());

        let started = Instant::now();
        let outcome = self.vm.start(&compiled.bytecode, shared);
        self.finish_span(outcome, started, compiled.cache_hit)
    }

    /// Resume a parked instance with the host's resolution.
    pub fn resume(&mut self, resolution: Resolution, budget: ResumeBudget) -> Result<WasmResult> {
        if self.state != InstanceState::Parked {
            return Err(RuntimeError::Instance(format!(
                "resume on non-parked instance ({:?})",
                self.state
            )));
        }

        let shared = self
            .ctx
            .clone()
            .ok_or_else(|| RuntimeError::Instance("parked instance lost its context".into()))?;

        self.state = InstanceState::Running;
        self.suspension_id = None;
        shared.lock().enforcer.resume(budget);

        let started = Instant::now();
        let outcome = self.vm.resume(resolution, shared);
        self.finish_span(outcome, started, true)
    }

    /// Replace the state mirror with a refreshed host snapshot. Only
    /// meaningful while parked, before the matching resume.
    pub fn refresh_state(&mut self, snapshot: HashMap<String, RuntimeValue>) -> Result<()> {
        if self.state != InstanceState::Parked {
            return Err(RuntimeError::Instance(
                "state refresh outside of park".into(),
            ));
        }
        let shared = self
            .ctx
            .as_ref()
            .ok_or_else(|| RuntimeError::Instance("parked instance lost its context".into()))?;
        shared.lock().refresh_state(snapshot);
        Ok(())
    }

    fn finish_span(
        &mut self,
        outcome: Result<VmOutcome>,
        started: Instant,
        cache_hit: bool,
    ) -> Result<WasmResult> {
        let duration = started.elapsed();

        let shared = self
            .ctx
            .clone()
            .ok_or_else(|| RuntimeError::Instance("running instance lost its context".into()))?;

        let (effects, logs, host_calls, suspension) = {
            let mut context = shared.lock();
            let host_calls: HashMap<String, u32> = std::mem::take(&mut context.host_call_counts)
                .into_iter()
                .map(|(name, count)| (name.to_string(), count))
                .collect();
            (
                context.take_effects(),
                context.take_logs(),
                host_calls,
                context.suspension.take(),
            )
        };

        let metrics = ExecutionMetrics::new()
            .with_duration(duration)
            .with_memory(self.vm.memory_used(), self.vm.memory_peak())
            .with_host_calls(host_calls)
            .with_cache_hit(cache_hit);

        match outcome {
            Ok(VmOutcome::Completed(return_value)) => {
                self.state = InstanceState::Idle;
                self.ctx = None;
                debug!(instance_id = %self.id, "handler completed");
                Ok(WasmResult::success(return_value, metrics)
                    .with_effects(effects)
                    .with_logs(logs))
            }
            Ok(VmOutcome::Suspended) => {
                let suspension = suspension.ok_or_else(|| {
                    self.terminate();
                    RuntimeError::Instance("suspended outcome without recorded suspension".into())
                })?;

                shared.lock().enforcer.park();
                self.state = InstanceState::Parked;
                self.suspension_id = Some(suspension.id.clone());
                debug!(
                    instance_id = %self.id,
                    suspension_id = %suspension.id,
                    extension = %suspension.extension_name,
                    "handler suspended"
                );

                Ok(WasmResult::suspended(
                    SuspensionDetails {
                        suspension_id: suspension.id,
                        extension_name: suspension.extension_name,
                        method: suspension.method,
                        args: suspension.args,
                    },
                    metrics,
                )
                .with_effects(effects)
                .with_logs(logs))
            }
            Ok(VmOutcome::Faulted(error)) => {
                // Failed executions never go back to the pool.
                self.terminate();
                debug!(instance_id = %self.id, code = %error.code, "handler faulted");
                Ok(WasmResult::error(error, metrics)
                    .with_effects(effects)
                    .with_logs(logs))
            }
            Err(e) => {
                self.terminate();
                Err(e)
            }
        }
    }

    /// Reset for reuse: drops script globals and pending continuations,
    /// clears the context, keeps the memory arena.
    pub fn reset(&mut self) -> Result<()> {
        if self.state == InstanceState::Terminated {
            return Err(RuntimeError::Instance(
                "cannot reset terminated instance".into(),
            ));
        }

        self.vm.reset()?;
        self.state = InstanceState::Idle;
        self.ctx = None;
        self.suspension_id = None;
        Ok(())
    }

    /// Release the VM unconditionally. Terminal.
    pub fn terminate(&mut self) {
        self.state = InstanceState::Terminated;
        self.ctx = None;
        self.suspension_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::context::{Effect, ExecutionStatus};
    use crate::engine::binding::EngineBinding;
    use crate::engine::scripted::ScriptedBinding;
    use crate::error::ErrorCode;
    use std::collections::HashMap;

    fn instance() -> (ScriptedBinding, Instance) {
        let binding = ScriptedBinding::new();
        let vm = binding.create_vm().expect("vm");
        (binding, Instance::new(vm))
    }

    fn compiled(binding: &ScriptedBinding, program: &str) -> CompiledHandler {
        let bytecode = binding.compile(program).expect("compile");
        CompiledHandler::from_bytecode(binding.version_tag(), bytecode)
    }

    fn limits() -> ExecutionLimits {
        RuntimeConfig::default().execution_limits(None)
    }

    fn http_registry() -> HashMap<String, Vec<String>> {
        let mut registry = HashMap::new();
        registry.insert("http".to_string(), vec!["get".to_string()]);
        registry
    }

    #[test]
    fn test_execute_success_resets_to_idle() {
        let (binding, mut instance) = instance();
        let handler = compiled(
            &binding,
            r#"[
                {"op":"stateSet","key":"x","value":1},
                {"op":"returnValue","value":42}
            ]"#,
        );

        let result = instance
            .execute(&handler, HandlerContext::new("p", "h"), limits())
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.return_value, Some(RuntimeValue::Int(42)));
        assert_eq!(result.effects.len(), 1);
        assert_eq!(instance.state(), InstanceState::Idle);
    }

    #[test]
    fn test_execute_requires_idle() {
        let (binding, mut instance) = instance();
        let handler = compiled(
            &binding,
            r#"[{"op":"extCall","extension":"http","method":"get"}]"#,
        );

        let result = instance
            .execute(
                &handler,
                HandlerContext::new("p", "h").with_extensions(http_registry()),
                limits(),
            )
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Suspended);
        assert_eq!(instance.state(), InstanceState::Parked);

        // Executing a parked instance is a host bug.
        assert!(instance
            .execute(&handler, HandlerContext::new("p", "h"), limits())
            .is_err());
    }

    #[test]
    fn test_suspension_drains_effects_eagerly() {
        let (binding, mut instance) = instance();
        let handler = compiled(
            &binding,
            r#"[
                {"op":"stateSet","key":"s","value":"loading"},
                {"op":"extCall","extension":"http","method":"get","args":["u"]},
                {"op":"stateSetFromLast","key":"s","path":"status"},
                {"op":"returnLast","path":"status"}
            ]"#,
        );

        let result = instance
            .execute(
                &handler,
                HandlerContext::new("p", "h").with_extensions(http_registry()),
                limits(),
            )
            .unwrap();

        // Pre-suspension mutation delivered with the suspension itself.
        assert_eq!(result.status, ExecutionStatus::Suspended);
        assert_eq!(result.effects.len(), 1);
        let suspension = result.suspension.expect("suspension");
        assert_eq!(suspension.extension_name, "http");
        assert_eq!(instance.suspension_id(), Some(suspension.suspension_id.as_str()));

        // The resume span delivers only post-suspension effects.
        let mut payload = HashMap::new();
        payload.insert("status".to_string(), RuntimeValue::from("ok"));
        let result = instance
            .resume(Resolution::ok(RuntimeValue::Map(payload)), ResumeBudget::Reset)
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.return_value, Some(RuntimeValue::from("ok")));
        assert_eq!(result.effects.len(), 1);
        assert!(
            matches!(&result.effects[0], Effect::State(m) if m.value == RuntimeValue::from("ok"))
        );
        assert_eq!(instance.state(), InstanceState::Idle);
    }

    #[test]
    fn test_fault_terminates_instance() {
        let (binding, mut instance) = instance();
        let handler = compiled(&binding, r#"[{"op":"throw","message":"bad"}]"#);

        let result = instance
            .execute(&handler, HandlerContext::new("p", "h"), limits())
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error.expect("error").code, ErrorCode::ExecutionError);
        assert_eq!(instance.state(), InstanceState::Terminated);
        assert!(instance.reset().is_err());
    }

    #[test]
    fn test_state_refresh_only_while_parked() {
        let (binding, mut instance) = instance();

        assert!(instance.refresh_state(HashMap::new()).is_err());

        let handler = compiled(
            &binding,
            r#"[
                {"op":"extCall","extension":"http","method":"get"},
                {"op":"stateGet","key":"fresh"},
                {"op":"returnLast"}
            ]"#,
        );
        instance
            .execute(
                &handler,
                HandlerContext::new("p", "h").with_extensions(http_registry()),
                limits(),
            )
            .unwrap();

        let mut snapshot = HashMap::new();
        snapshot.insert("fresh".to_string(), RuntimeValue::Int(7));
        instance.refresh_state(snapshot).unwrap();

        let result = instance
            .resume(Resolution::ok(RuntimeValue::Null), ResumeBudget::Reset)
            .unwrap();
        assert_eq!(result.return_value, Some(RuntimeValue::Int(7)));
    }

    #[test]
    fn test_reset_then_reuse() {
        let (binding, mut instance) = instance();
        let handler = compiled(&binding, r#"[{"op":"returnValue","value":1}]"#);

        instance
            .execute(&handler, HandlerContext::new("p", "h"), limits())
            .unwrap();
        instance.reset().unwrap();

        let result = instance
            .execute(&handler, HandlerContext::new("p", "h"), limits())
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(instance.executions(), 2);
    }
}
