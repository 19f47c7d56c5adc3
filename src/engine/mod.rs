//! Engine management: the embedding API over pool, compiler, and bindings.
//!
//! [`Runtime`] is what hosts hold. It owns the instance pool, the
//! compiled-handler cache, and the metrics registry, and it drives the
//! suspend/resume protocol: an `execute` that suspends parks the instance
//! and hands the suspension to the host; the host performs the extension
//! I/O and calls `resume` with the resolution.

pub mod binding;
pub mod compiler;
pub mod instance;
pub mod limits;
pub mod pool;
pub mod scripted;
pub mod wasm;

use crate::config::RuntimeConfig;
use crate::context::{HandlerContext, Resolution, WasmResult};
use crate::engine::binding::EngineBinding;
use crate::engine::compiler::{CompiledHandler, HandlerCompiler};
use crate::engine::limits::ResumeBudget;
use crate::engine::pool::{InstancePool, PoolHandle};
use crate::engine::wasm::WasmEngineBinding;
use crate::error::{Result, RuntimeError};
use crate::metrics::{MetricsCollector, RuntimeStats};
use crate::value::RuntimeValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// How to stop the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop admitting, drain in-flight executions, then terminate
    Graceful,
    /// Terminate everything immediately; pending resumes fail
    Hard,
}

/// The handler execution runtime
pub struct Runtime {
    config: RuntimeConfig,
    pool: InstancePool,
    compiler: HandlerCompiler,
    metrics: Arc<MetricsCollector>,
}

impl Runtime {
    /// Create a runtime over the bundled wasmtime engine binding.
    ///
    /// Requires `engine_module_path` in the configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let binding = Arc::new(WasmEngineBinding::new(&config)?);
        Self::with_binding(config, binding)
    }

    /// Create a runtime over an explicit engine binding.
    ///
    /// Hosts without the engine module (CI, development) pair this with
    /// [`scripted::ScriptedBinding`].
    pub fn with_binding(config: RuntimeConfig, binding: Arc<dyn EngineBinding>) -> Result<Self> {
        config.validate()?;

        info!(
            max_instances = config.max_instances,
            memory_limit = config.memory_limit_bytes,
            engine = binding.version_tag(),
            "initializing handler runtime"
        );

        let metrics = Arc::new(MetricsCollector::new());
        let pool = InstancePool::new(&config, Arc::clone(&binding), Arc::clone(&metrics))?;
        let compiler = HandlerCompiler::new(
            binding,
            config.max_cache_bytes,
            config.cache_dir.clone(),
            config.max_disk_cache_bytes,
        )?;

        Ok(Self {
            config,
            pool,
            compiler,
            metrics,
        })
    }

    /// The configuration this runtime was built with
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Compile handler source, consulting the two-tier cache.
    #[instrument(skip(self, source))]
    pub async fn compile(&self, source: &str) -> Result<CompiledHandler> {
        match self.compiler.compile(source).await {
            Ok(compiled) => {
                self.metrics.record_cache_lookup(compiled.cache_hit);
                Ok(compiled)
            }
            Err(e) => {
                if let RuntimeError::Handler(err) = &e {
                    self.metrics.record_error(&err.code.to_string());
                }
                Err(e)
            }
        }
    }

    /// Reconstruct a compiled handler from bytecode the host persisted.
    pub fn handler_from_bytecode(&self, bytecode: Vec<u8>) -> CompiledHandler {
        CompiledHandler::from_bytecode(&self.config.engine_version_tag, bytecode)
    }

    /// Execute a compiled handler in an isolated instance.
    ///
    /// `timeout_ms` overrides the configured default wall-clock budget.
    #[instrument(
        skip(self, compiled, context),
        fields(panel_id = %context.panel_id, handler = %context.handler_name)
    )]
    pub async fn execute(
        &self,
        compiled: &CompiledHandler,
        context: HandlerContext,
        timeout_ms: Option<u32>,
    ) -> Result<WasmResult> {
        let limits = self.config.execution_limits(timeout_ms);
        let mut handle = self.pool.acquire().await?;
        debug!(instance_id = %handle.id(), "acquired instance");

        let compiled = compiled.clone();
        let (handle, result) = tokio::task::spawn_blocking(move || {
            let result = handle.instance.execute(&compiled, context, limits);
            (handle, result)
        })
        .await
        .map_err(|e| RuntimeError::Instance(format!("execution task failed: {e}")))?;

        self.settle(handle, result)
    }

    /// Compile and execute handler source in one call.
    pub async fn execute_source(
        &self,
        source: &str,
        context: HandlerContext,
        timeout_ms: Option<u32>,
    ) -> Result<WasmResult> {
        let compiled = self.compile(source).await?;
        self.execute(&compiled, context, timeout_ms).await
    }

    /// Resume a suspended handler with the host's resolution. Only the
    /// first resume for a suspension ID is honored.
    #[instrument(skip(self, resolution))]
    pub async fn resume(&self, suspension_id: &str, resolution: Resolution) -> Result<WasmResult> {
        let handle = self.pool.unpark(suspension_id)?;
        self.resume_inner(handle, resolution).await
    }

    /// Resume with a refreshed state snapshot.
    ///
    /// The snapshot replaces the instance's state mirror before execution
    /// continues, when `refresh_state_on_resume` is configured (the
    /// default); otherwise it is ignored and the mirror is trusted.
    #[instrument(skip(self, resolution, snapshot))]
    pub async fn resume_with_snapshot(
        &self,
        suspension_id: &str,
        resolution: Resolution,
        snapshot: HashMap<String, RuntimeValue>,
    ) -> Result<WasmResult> {
        let mut handle = self.pool.unpark(suspension_id)?;

        if self.config.refresh_state_on_resume {
            if let Err(e) = handle.instance.refresh_state(snapshot) {
                handle.instance.terminate();
                self.pool.release(handle);
                return Err(e);
            }
        } else {
            debug!("state refresh disabled; trusting mirror");
        }

        self.resume_inner(handle, resolution).await
    }

    async fn resume_inner(&self, mut handle: PoolHandle, resolution: Resolution) -> Result<WasmResult> {
        debug!(instance_id = %handle.id(), "resuming instance");

        let (handle, result) = tokio::task::spawn_blocking(move || {
            let result = handle.instance.resume(resolution, ResumeBudget::Reset);
            (handle, result)
        })
        .await
        .map_err(|e| RuntimeError::Instance(format!("resume task failed: {e}")))?;

        self.settle(handle, result)
    }

    /// Cancel a parked suspension: the instance is terminated and the
    /// permit released. The resolution never reaches the handler.
    #[instrument(skip(self))]
    pub async fn cancel(&self, suspension_id: &str, reason: &str) -> Result<()> {
        let mut handle = self.pool.unpark(suspension_id)?;
        warn!(instance_id = %handle.id(), reason, "cancelling suspension");

        handle.instance.terminate();
        self.pool.release(handle);
        Ok(())
    }

    /// Runtime statistics snapshot
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            total_executions: self.metrics.total_executions(),
            active: self.pool.active_count(),
            available: self.pool.idle_count(),
            parked: self.pool.parked_count(),
            cache_hit_rate: self.metrics.cache_hit_rate(),
            avg_exec_us: self.metrics.avg_execution_time_us(),
            memory_total: self.pool.memory_total(),
        }
    }

    /// Metrics in text exposition format
    pub fn metrics_text(&self) -> String {
        self.metrics.render(self.pool.gauges())
    }

    /// Shut the runtime down.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        info!(?mode, "shutting down runtime");
        self.pool.shutdown(mode == ShutdownMode::Graceful).await;
    }

    /// Route a finished span: park suspensions, pool or destroy everything
    /// else, and fold the span into the metrics registry.
    fn settle(&self, handle: PoolHandle, result: Result<WasmResult>) -> Result<WasmResult> {
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                // Instance-level failure: the instance terminated itself.
                self.pool.release(handle);
                return Err(e);
            }
        };

        self.metrics
            .record_instance_peak(handle.id(), handle.memory_peak());
        self.metrics.record_execution(&result.metrics, result.status);
        if let Some(error) = &result.error {
            self.metrics.record_error(&error.code.to_string());
        }

        match &result.suspension {
            Some(suspension) => {
                self.pool.park(handle, &suspension.suspension_id)?;
            }
            None => self.pool.release(handle),
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedBinding;

    fn runtime() -> Runtime {
        let config = RuntimeConfig::default().with_min_instances(1);
        Runtime::with_binding(config, Arc::new(ScriptedBinding::new())).expect("runtime")
    }

    #[tokio::test]
    async fn test_runtime_creation() {
        let runtime = runtime();
        let stats = runtime.stats();

        assert_eq!(stats.total_executions, 0);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.parked, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = RuntimeConfig::default().with_max_instances(0);
        assert!(Runtime::with_binding(config, Arc::new(ScriptedBinding::new())).is_err());
    }

    #[tokio::test]
    async fn test_handler_from_bytecode_tagged() {
        let runtime = runtime();
        let compiled = runtime.handler_from_bytecode(vec![1, 2, 3]);
        assert!(compiled.cache_hit);
        assert!(!compiled.fingerprint.is_empty());
    }

    // Full execution scenarios live in tests/runtime.rs against the
    // public API.
}
