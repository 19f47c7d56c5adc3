//! Runtime configuration types and defaults.
//!
//! This module defines the configuration options for the handler runtime:
//! pool sizing, per-instance memory and stack ceilings, per-invocation
//! resource budgets, and the compiled-handler cache.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default memory limit per instance (32 MB)
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 32 * 1024 * 1024;

/// Default stack size per instance (1 MB)
pub const DEFAULT_STACK_SIZE_BYTES: u64 = 1024 * 1024;

/// Default maximum instances in the pool
pub const DEFAULT_MAX_INSTANCES: usize = 10;

/// Default pre-warmed instances at startup
pub const DEFAULT_MIN_INSTANCES: usize = 1;

/// Default handler timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u32 = 5000;

/// Default maximum host ABI calls per invocation
pub const DEFAULT_MAX_HOST_CALLS: u32 = 10_000;

/// Default maximum state mutations per invocation
pub const DEFAULT_MAX_STATE_MUTATIONS: u32 = 1000;

/// Default maximum event emissions per invocation
pub const DEFAULT_MAX_EVENTS: u32 = 100;

/// Default in-memory compiled-handler cache budget (64 MB)
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 64 * 1024 * 1024;

/// Default disk cache budget (256 MB)
pub const DEFAULT_MAX_DISK_CACHE_BYTES: u64 = 256 * 1024 * 1024;

/// Default interrupt-check period for running handlers (ms)
pub const DEFAULT_YIELD_INTERVAL_MS: u64 = 10;

/// Configuration for the handler runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Upper bound on concurrent active + parked instances
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Pre-warmed idle instances created at startup
    #[serde(default = "default_min_instances")]
    pub min_instances: usize,

    /// Linear memory ceiling per instance in bytes
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: u64,

    /// Stack ceiling per instance in bytes
    #[serde(default = "default_stack_size")]
    pub stack_size_bytes: u64,

    /// Default per-invocation wall-clock budget in milliseconds
    #[serde(default = "default_timeout")]
    pub default_timeout_ms: u32,

    /// Maximum host ABI calls per invocation
    #[serde(default = "default_max_host_calls")]
    pub max_host_calls: u32,

    /// Maximum state mutations per invocation
    #[serde(default = "default_max_state_mutations")]
    pub max_state_mutations: u32,

    /// Maximum event emissions per invocation
    #[serde(default = "default_max_events")]
    pub max_events: u32,

    /// In-memory compiled-handler cache budget in bytes
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,

    /// Disk cache budget in bytes
    #[serde(default = "default_max_disk_cache_bytes")]
    pub max_disk_cache_bytes: u64,

    /// Directory for the disk bytecode cache, or `None` to disable it
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Version tag mixed into compile fingerprints; bumping it invalidates
    /// every cached bytecode entry
    #[serde(default = "default_engine_version_tag")]
    pub engine_version_tag: String,

    /// Path to the script-engine WASM module
    #[serde(default)]
    pub engine_module_path: Option<PathBuf>,

    /// Apply host-supplied state snapshots to the mirror on resume
    #[serde(default = "default_true")]
    pub refresh_state_on_resume: bool,

    /// How long `execute` may wait for a pool permit before reporting busy,
    /// or `None` to wait indefinitely
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,

    /// Period of the interrupt ticker that bounds how late a timeout can
    /// fire inside a compute-only handler
    #[serde(default = "default_yield_interval")]
    pub yield_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_instances: DEFAULT_MAX_INSTANCES,
            min_instances: DEFAULT_MIN_INSTANCES,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            stack_size_bytes: DEFAULT_STACK_SIZE_BYTES,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_host_calls: DEFAULT_MAX_HOST_CALLS,
            max_state_mutations: DEFAULT_MAX_STATE_MUTATIONS,
            max_events: DEFAULT_MAX_EVENTS,
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            max_disk_cache_bytes: DEFAULT_MAX_DISK_CACHE_BYTES,
            cache_dir: None,
            engine_version_tag: default_engine_version_tag(),
            engine_module_path: None,
            refresh_state_on_resume: true,
            acquire_timeout_ms: None,
            yield_interval_ms: DEFAULT_YIELD_INTERVAL_MS,
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of instances
    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    /// Set the number of pre-warmed instances
    pub fn with_min_instances(mut self, min: usize) -> Self {
        self.min_instances = min;
        self
    }

    /// Set the memory limit per instance
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Set the stack ceiling per instance
    pub fn with_stack_size(mut self, bytes: u64) -> Self {
        self.stack_size_bytes = bytes;
        self
    }

    /// Set the default invocation timeout
    pub fn with_default_timeout_ms(mut self, ms: u32) -> Self {
        self.default_timeout_ms = ms;
        self
    }

    /// Set the per-invocation host call ceiling
    pub fn with_max_host_calls(mut self, max: u32) -> Self {
        self.max_host_calls = max;
        self
    }

    /// Set the per-invocation state mutation ceiling
    pub fn with_max_state_mutations(mut self, max: u32) -> Self {
        self.max_state_mutations = max;
        self
    }

    /// Set the per-invocation event ceiling
    pub fn with_max_events(mut self, max: u32) -> Self {
        self.max_events = max;
        self
    }

    /// Set the in-memory cache budget
    pub fn with_max_cache_bytes(mut self, bytes: u64) -> Self {
        self.max_cache_bytes = bytes;
        self
    }

    /// Set the disk cache directory
    pub fn with_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Set the engine version tag
    pub fn with_engine_version_tag(mut self, tag: impl Into<String>) -> Self {
        self.engine_version_tag = tag.into();
        self
    }

    /// Set the script-engine module path
    pub fn with_engine_module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.engine_module_path = Some(path.into());
        self
    }

    /// Set the acquire timeout
    pub fn with_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = Some(ms);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_instances == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_instances".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.min_instances > self.max_instances {
            return Err(ConfigError::InvalidValue {
                field: "min_instances".into(),
                reason: "must not exceed max_instances".into(),
            });
        }

        if self.memory_limit_bytes < 1024 * 1024 {
            return Err(ConfigError::InvalidValue {
                field: "memory_limit_bytes".into(),
                reason: "must be at least 1MB".into(),
            });
        }

        if self.stack_size_bytes < 64 * 1024 {
            return Err(ConfigError::InvalidValue {
                field: "stack_size_bytes".into(),
                reason: "must be at least 64KB".into(),
            });
        }

        if self.default_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "default_timeout_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.yield_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "yield_interval_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Per-invocation limits derived from this configuration, with an
    /// optional timeout override.
    pub fn execution_limits(&self, timeout_ms: Option<u32>) -> ExecutionLimits {
        ExecutionLimits {
            timeout_ms: timeout_ms.unwrap_or(self.default_timeout_ms),
            memory_limit_bytes: self.memory_limit_bytes,
            max_host_calls: self.max_host_calls,
            max_state_mutations: self.max_state_mutations,
            max_events: self.max_events,
        }
    }
}

/// Per-invocation resource limits armed on each execute/resume
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLimits {
    /// Wall-clock budget in milliseconds (on-CPU time; parked time excluded)
    pub timeout_ms: u32,

    /// Memory ceiling in bytes
    pub memory_limit_bytes: u64,

    /// Maximum host ABI calls
    pub max_host_calls: u32,

    /// Maximum state mutations
    pub max_state_mutations: u32,

    /// Maximum event emissions
    pub max_events: u32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        RuntimeConfig::default().execution_limits(None)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it is invalid
        reason: String,
    },

    /// Missing required field
    #[error("missing required configuration field: {field}")]
    MissingField {
        /// The field name
        field: String,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_max_instances() -> usize {
    DEFAULT_MAX_INSTANCES
}

fn default_min_instances() -> usize {
    DEFAULT_MIN_INSTANCES
}

fn default_memory_limit() -> u64 {
    DEFAULT_MEMORY_LIMIT_BYTES
}

fn default_stack_size() -> u64 {
    DEFAULT_STACK_SIZE_BYTES
}

fn default_timeout() -> u32 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_host_calls() -> u32 {
    DEFAULT_MAX_HOST_CALLS
}

fn default_max_state_mutations() -> u32 {
    DEFAULT_MAX_STATE_MUTATIONS
}

fn default_max_events() -> u32 {
    DEFAULT_MAX_EVENTS
}

fn default_max_cache_bytes() -> u64 {
    DEFAULT_MAX_CACHE_BYTES
}

fn default_max_disk_cache_bytes() -> u64 {
    DEFAULT_MAX_DISK_CACHE_BYTES
}

fn default_engine_version_tag() -> String {
    format!("qjs-{}", env!("CARGO_PKG_VERSION"))
}

fn default_yield_interval() -> u64 {
    DEFAULT_YIELD_INTERVAL_MS
}

fn default_true() -> bool {
    true
}
