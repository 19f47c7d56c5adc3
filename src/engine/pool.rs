//! Instance pool management.
//!
//! Instances are expensive to create, so the pool keeps reset instances on
//! an idle queue and re-issues them. The semaphore is the sole admission
//! control: its permits equal `max_instances` minus active minus parked,
//! because a parked instance keeps its permit until resumed or cancelled.
//! Parked instances also keep their memory, which the pool accounts
//! against the global budget.

use crate::config::RuntimeConfig;
use crate::engine::binding::EngineBinding;
use crate::engine::instance::{Instance, InstanceState};
use crate::error::{FatalKind, HandlerError, ResourceKind, Result, RuntimeError};
use crate::metrics::{MetricsCollector, PoolGauges};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// An instance checked out of the pool. Holds the admission permit; the
/// permit returns to the pool when the handle is released or the entry is
/// cancelled, never while parked.
pub struct PoolHandle {
    /// The checked-out instance
    pub instance: Instance,
    permit: OwnedSemaphorePermit,
    charged_memory: u64,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("instance", &self.instance)
            .field("charged_memory", &self.charged_memory)
            .finish()
    }
}

impl std::ops::Deref for PoolHandle {
    type Target = Instance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl std::ops::DerefMut for PoolHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.instance
    }
}

struct ParkedEntry {
    instance: Instance,
    permit: OwnedSemaphorePermit,
    charged_memory: u64,
}

struct PoolInner {
    config: RuntimeConfig,
    binding: Arc<dyn EngineBinding>,
    metrics: Arc<MetricsCollector>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Instance>>,
    parked: Mutex<HashMap<String, ParkedEntry>>,
    /// Suspension IDs already honored, for `already-resumed` detection
    resolved: Mutex<HashSet<String>>,
    active_count: AtomicUsize,
    instances_created: AtomicU64,
    instances_destroyed: AtomicU64,
    memory_total: AtomicU64,
    shutting_down: AtomicBool,
}

/// Bounded-concurrency instance pool with pre-warming and suspension park
pub struct InstancePool {
    inner: Arc<PoolInner>,
}

impl InstancePool {
    /// Create a pool and pre-warm `min_instances` idle instances.
    pub fn new(
        config: &RuntimeConfig,
        binding: Arc<dyn EngineBinding>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let max_instances = config.max_instances;

        info!(
            max_instances,
            min_instances = config.min_instances,
            "creating instance pool"
        );

        let inner = Arc::new(PoolInner {
            config: config.clone(),
            binding,
            metrics,
            semaphore: Arc::new(Semaphore::new(max_instances)),
            idle: Mutex::new(VecDeque::with_capacity(max_instances)),
            parked: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashSet::new()),
            active_count: AtomicUsize::new(0),
            instances_created: AtomicU64::new(0),
            instances_destroyed: AtomicU64::new(0),
            memory_total: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        });

        {
            let mut idle = inner.idle.lock();
            for _ in 0..config.min_instances {
                match inner.create_instance() {
                    Ok(instance) => idle.push_back(instance),
                    Err(e) => {
                        warn!(error = %e, "failed to pre-warm instance");
                        break;
                    }
                }
            }
            debug!(count = idle.len(), "pre-warmed pool");
        }

        Ok(Self { inner })
    }

    /// Acquire an instance, blocking until a permit is available.
    ///
    /// With `acquire_timeout_ms` configured, saturation surfaces as
    /// [`RuntimeError::Busy`] once the timeout elapses.
    pub async fn acquire(&self) -> Result<PoolHandle> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShuttingDown);
        }

        let semaphore = Arc::clone(&self.inner.semaphore);
        let permit = match self.inner.config.acquire_timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), semaphore.acquire_owned())
                    .await
                {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(RuntimeError::ShuttingDown),
                    Err(_) => return Err(RuntimeError::Busy),
                }
            }
            None => semaphore
                .acquire_owned()
                .await
                .map_err(|_| RuntimeError::ShuttingDown)?,
        };

        let instance = {
            let popped = self.inner.idle.lock().pop_back();
            match popped {
                Some(instance) => {
                    debug!(id = %instance.id(), "reusing pooled instance");
                    instance
                }
                None => self.inner.create_instance()?,
            }
        };

        self.inner.active_count.fetch_add(1, Ordering::SeqCst);
        let charged_memory = instance.memory_used();
        self.inner
            .memory_total
            .fetch_add(charged_memory, Ordering::SeqCst);

        Ok(PoolHandle {
            instance,
            permit,
            charged_memory,
        })
    }

    /// Return an instance after an execute/resume span completed (success
    /// or error). Healthy instances are reset onto the idle queue; failed
    /// ones are destroyed. Either way the permit is restored.
    pub fn release(&self, mut handle: PoolHandle) {
        self.inner.active_count.fetch_sub(1, Ordering::SeqCst);
        self.inner
            .memory_total
            .fetch_sub(handle.charged_memory, Ordering::SeqCst);

        let shutting_down = self.inner.shutting_down.load(Ordering::SeqCst);

        match handle.instance.state() {
            InstanceState::Idle if !shutting_down => match handle.instance.reset() {
                Ok(()) => {
                    debug!(id = %handle.instance.id(), "returned instance to pool");
                    self.inner.idle.lock().push_back(handle.instance);
                }
                Err(e) => {
                    warn!(id = %handle.instance.id(), error = %e, "reset failed, destroying");
                    self.inner.destroy(handle.instance);
                }
            },
            InstanceState::Terminated | InstanceState::Idle => {
                self.inner.destroy(handle.instance);
            }
            other => {
                warn!(id = %handle.instance.id(), state = ?other, "released instance in unexpected state");
                self.inner.destroy(handle.instance);
            }
        }

        drop(handle.permit);
    }

    /// Park a suspended instance under its suspension ID. The permit moves
    /// into the parked entry; admission capacity stays consumed and the
    /// instance's memory stays charged.
    pub fn park(&self, handle: PoolHandle, suspension_id: &str) -> Result<()> {
        let PoolHandle {
            instance,
            permit,
            charged_memory,
        } = handle;

        if instance.state() != InstanceState::Parked {
            self.inner.active_count.fetch_sub(1, Ordering::SeqCst);
            self.inner
                .memory_total
                .fetch_sub(charged_memory, Ordering::SeqCst);
            self.inner.destroy(instance);
            return Err(RuntimeError::Instance(
                "park of an instance that is not suspended".into(),
            ));
        }

        if self.inner.shutting_down.load(Ordering::SeqCst) {
            // Too late to park: the shutdown sweep may already have drained
            // the parked map, so this instance would never be resumed.
            self.inner.active_count.fetch_sub(1, Ordering::SeqCst);
            self.inner
                .memory_total
                .fetch_sub(charged_memory, Ordering::SeqCst);
            self.inner.destroy(instance);
            return Err(RuntimeError::ShuttingDown);
        }

        // Settle the memory charge to the instance's current footprint.
        let current = instance.memory_used();
        if current > charged_memory {
            self.inner
                .memory_total
                .fetch_add(current - charged_memory, Ordering::SeqCst);
        } else {
            self.inner
                .memory_total
                .fetch_sub(charged_memory - current, Ordering::SeqCst);
        }

        self.inner.active_count.fetch_sub(1, Ordering::SeqCst);

        let budget =
            self.inner.config.max_instances as u64 * self.inner.config.memory_limit_bytes;
        if self.inner.memory_total.load(Ordering::SeqCst) > budget {
            error!(
                memory_total = self.inner.memory_total.load(Ordering::SeqCst),
                budget, "pool memory budget exceeded"
            );
            self.inner
                .memory_total
                .fetch_sub(current, Ordering::SeqCst);
            self.inner.destroy(instance);
            return Err(RuntimeError::Handler(HandlerError::fatal(
                FatalKind::Invariant,
                "pool memory budget exceeded",
            )));
        }

        debug!(suspension_id, "parked instance");
        self.inner.parked.lock().insert(
            suspension_id.to_string(),
            ParkedEntry {
                instance,
                permit,
                charged_memory: current,
            },
        );

        Ok(())
    }

    /// Take a parked instance back for resume. The first unpark for an ID
    /// wins; later attempts report `already-resumed`, never-issued IDs
    /// report `unknown-suspension`.
    pub fn unpark(&self, suspension_id: &str) -> Result<PoolHandle> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShuttingDown);
        }

        let entry = self.inner.parked.lock().remove(suspension_id);

        match entry {
            Some(entry) => {
                self.inner
                    .resolved
                    .lock()
                    .insert(suspension_id.to_string());
                self.inner.active_count.fetch_add(1, Ordering::SeqCst);
                debug!(suspension_id, "unparked instance");
                Ok(PoolHandle {
                    instance: entry.instance,
                    permit: entry.permit,
                    charged_memory: entry.charged_memory,
                })
            }
            None => {
                let kind = if self.inner.resolved.lock().contains(suspension_id) {
                    ResourceKind::AlreadyResumed
                } else {
                    ResourceKind::UnknownSuspension
                };
                Err(RuntimeError::Handler(HandlerError::resource_limit(
                    kind,
                    format!("suspension '{}'", suspension_id),
                )))
            }
        }
    }

    /// Instances currently executing
    pub fn active_count(&self) -> usize {
        self.inner.active_count.load(Ordering::SeqCst)
    }

    /// Idle instances available for reuse
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Instances parked on a suspension
    pub fn parked_count(&self) -> usize {
        self.inner.parked.lock().len()
    }

    /// Instances created over the pool lifetime
    pub fn instances_created(&self) -> u64 {
        self.inner.instances_created.load(Ordering::SeqCst)
    }

    /// Instances destroyed over the pool lifetime
    pub fn instances_destroyed(&self) -> u64 {
        self.inner.instances_destroyed.load(Ordering::SeqCst)
    }

    /// Memory charged to active and parked instances
    pub fn memory_total(&self) -> u64 {
        self.inner.memory_total.load(Ordering::SeqCst)
    }

    /// Gauges for metrics exposition
    pub fn gauges(&self) -> PoolGauges {
        PoolGauges {
            active: self.active_count(),
            parked: self.parked_count(),
            idle: self.idle_count(),
        }
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop admitting, optionally drain in-flight executions, then
    /// terminate every instance. Parked instances are terminated; their
    /// pending resumes fail.
    pub async fn shutdown(&self, graceful: bool) {
        info!(graceful, "shutting down instance pool");
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();

        if graceful {
            while self.inner.active_count.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        {
            let mut idle = self.inner.idle.lock();
            for instance in idle.drain(..) {
                self.inner.destroy(instance);
            }
        }

        {
            let mut parked = self.inner.parked.lock();
            let mut resolved = self.inner.resolved.lock();
            for (id, entry) in parked.drain() {
                self.inner
                    .memory_total
                    .fetch_sub(entry.charged_memory, Ordering::SeqCst);
                resolved.insert(id);
                self.inner.destroy(entry.instance);
            }
        }

        info!("instance pool shut down");
    }
}

impl Clone for InstancePool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PoolInner {
    fn create_instance(&self) -> Result<Instance> {
        let vm = self.binding.create_vm()?;
        let instance = Instance::new(vm);
        self.instances_created.fetch_add(1, Ordering::SeqCst);
        debug!(id = %instance.id(), "created instance");
        Ok(instance)
    }

    fn destroy(&self, mut instance: Instance) {
        self.metrics.drop_instance(instance.id());
        instance.terminate();
        self.instances_destroyed.fetch_add(1, Ordering::SeqCst);
        debug!(id = %instance.id(), "destroyed instance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedBinding;

    fn pool_with(config: RuntimeConfig) -> InstancePool {
        InstancePool::new(
            &config,
            Arc::new(ScriptedBinding::new()),
            Arc::new(MetricsCollector::new()),
        )
        .expect("pool")
    }

    fn pool() -> InstancePool {
        pool_with(RuntimeConfig::default().with_min_instances(1))
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let pool = pool();

        let handle = pool.acquire().await.unwrap();
        assert_eq!(pool.active_count(), 1);

        pool.release(handle);
        assert_eq!(pool.active_count(), 0);
        assert!(pool.idle_count() >= 1);
    }

    #[tokio::test]
    async fn test_prewarm_and_reuse() {
        let pool = pool_with(RuntimeConfig::default().with_min_instances(2));
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.instances_created(), 2);

        let handle = pool.acquire().await.unwrap();
        let id = handle.id().to_string();
        pool.release(handle);

        // LIFO reuse hands back the same instance.
        let handle = pool.acquire().await.unwrap();
        assert_eq!(handle.id(), id);
        assert_eq!(pool.instances_created(), 2);
        pool.release(handle);
    }

    #[tokio::test]
    async fn test_saturation_blocks_then_busy() {
        let config = RuntimeConfig::default()
            .with_max_instances(1)
            .with_min_instances(0)
            .with_acquire_timeout_ms(20);
        let pool = pool_with(config);

        let held = pool.acquire().await.unwrap();
        assert!(matches!(pool.acquire().await, Err(RuntimeError::Busy)));

        pool.release(held);
        let handle = pool.acquire().await.unwrap();
        pool.release(handle);
    }

    #[tokio::test]
    async fn test_counter_balance() {
        let pool = pool_with(RuntimeConfig::default().with_min_instances(0));

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.active_count(), 2);

        pool.release(a);
        pool.release(b);

        let created = pool.instances_created();
        let destroyed = pool.instances_destroyed();
        let live = pool.active_count() + pool.idle_count() + pool.parked_count();
        assert_eq!(live as u64, created - destroyed);
    }

    #[tokio::test]
    async fn test_unpark_unknown_and_already_resumed() {
        let pool = pool();

        let err = pool.unpark("s-none").expect_err("unknown");
        let RuntimeError::Handler(err) = err else {
            panic!("expected handler error");
        };
        assert_eq!(err.resource, Some(ResourceKind::UnknownSuspension));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let pool = pool();

        pool.shutdown(true).await;
        assert!(matches!(
            pool.acquire().await,
            Err(RuntimeError::ShuttingDown)
        ));
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_terminated_instance_not_pooled() {
        let pool = pool_with(RuntimeConfig::default().with_min_instances(0));

        let mut handle = pool.acquire().await.unwrap();
        handle.instance.terminate();
        pool.release(handle);

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.instances_destroyed(), 1);
    }
}
