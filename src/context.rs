//! Execution context types for handler execution.
//!
//! This module defines the per-invocation context the host supplies, the
//! effect buffer handlers fill through the ABI, and the results returned
//! from execution, including suspension details for async extension calls.

use crate::capability::{CapabilityChecker, CapabilityToken};
use crate::config::ExecutionLimits;
use crate::engine::limits::ResourceEnforcer;
use crate::error::HandlerError;
use crate::metrics::ExecutionMetrics;
use crate::value::RuntimeValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Per-invocation input supplied by the host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerContext {
    /// Panel ID, used for logging and metrics only
    pub panel_id: String,

    /// Tool or lifecycle handler name, used for logging and metrics only
    pub handler_name: String,

    /// Snapshot of current panel state
    pub state_snapshot: HashMap<String, RuntimeValue>,

    /// Keys of computed state values; writes to these are rejected
    #[serde(default)]
    pub computed_keys: HashSet<String>,

    /// Tool arguments (empty for lifecycle handlers)
    pub args: HashMap<String, RuntimeValue>,

    /// Loop/iteration-bound scope variables
    pub scope: HashMap<String, RuntimeValue>,

    /// Capability tokens granted for this call
    pub capabilities: Vec<CapabilityToken>,

    /// Extension registry: extension name to the methods it exposes
    pub extension_registry: HashMap<String, Vec<String>>,
}

impl HandlerContext {
    /// Create a new context
    pub fn new(panel_id: impl Into<String>, handler_name: impl Into<String>) -> Self {
        Self {
            panel_id: panel_id.into(),
            handler_name: handler_name.into(),
            state_snapshot: HashMap::new(),
            computed_keys: HashSet::new(),
            args: HashMap::new(),
            scope: HashMap::new(),
            capabilities: Vec::new(),
            extension_registry: HashMap::new(),
        }
    }

    /// Set the state snapshot
    pub fn with_state(mut self, state: HashMap<String, RuntimeValue>) -> Self {
        self.state_snapshot = state;
        self
    }

    /// Mark keys as computed (read-only to handlers)
    pub fn with_computed_keys(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.computed_keys = keys.into_iter().collect();
        self
    }

    /// Set the arguments
    pub fn with_args(mut self, args: HashMap<String, RuntimeValue>) -> Self {
        self.args = args;
        self
    }

    /// Set the scope variables
    pub fn with_scope(mut self, scope: HashMap<String, RuntimeValue>) -> Self {
        self.scope = scope;
        self
    }

    /// Set the capability tokens
    pub fn with_capabilities(mut self, caps: Vec<CapabilityToken>) -> Self {
        self.capabilities = caps;
        self
    }

    /// Set the extension registry
    pub fn with_extensions(mut self, ext: HashMap<String, Vec<String>>) -> Self {
        self.extension_registry = ext;
        self
    }
}

/// Execution status of a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Handler completed successfully
    Success,
    /// Handler encountered an error
    Error,
    /// Handler suspended awaiting an async extension resolution
    Suspended,
}

/// An externally observable action performed by a handler.
///
/// Effects of all kinds share one buffer so the host observes them in
/// production order, including across kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Effect {
    /// State mutation
    State(StateMutation),
    /// Emitted event
    Event(EmittedEvent),
    /// View command
    View(ViewCommand),
}

/// State mutation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMutation {
    /// State key
    pub key: String,

    /// New value (`Null` for deletes)
    pub value: RuntimeValue,

    /// Operation type
    pub op: MutationOp,
}

impl StateMutation {
    /// Create a set mutation
    pub fn set(key: impl Into<String>, value: RuntimeValue) -> Self {
        Self {
            key: key.into(),
            value,
            op: MutationOp::Set,
        }
    }

    /// Create a delete mutation
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: RuntimeValue::Null,
            op: MutationOp::Delete,
        }
    }
}

/// Mutation operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    /// Set a value
    Set,
    /// Delete a value
    Delete,
}

/// Event emission record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedEvent {
    /// Event name
    pub name: String,

    /// Event payload
    pub payload: RuntimeValue,
}

impl EmittedEvent {
    /// Create a new event
    pub fn new(name: impl Into<String>, payload: RuntimeValue) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// View command record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewCommand {
    /// Command type
    #[serde(rename = "type")]
    pub command_type: ViewCommandType,

    /// Target component ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,

    /// Command arguments
    pub args: HashMap<String, RuntimeValue>,
}

impl ViewCommand {
    /// Create a setFilter command
    pub fn set_filter(component_id: impl Into<String>, value: RuntimeValue) -> Self {
        let mut args = HashMap::new();
        args.insert("value".to_string(), value);
        Self {
            command_type: ViewCommandType::SetFilter,
            component_id: Some(component_id.into()),
            args,
        }
    }

    /// Create a scrollTo command
    pub fn scroll_to(component_id: impl Into<String>, position: RuntimeValue) -> Self {
        let mut args = HashMap::new();
        args.insert("position".to_string(), position);
        Self {
            command_type: ViewCommandType::ScrollTo,
            component_id: Some(component_id.into()),
            args,
        }
    }

    /// Create a focus command
    pub fn focus(component_id: impl Into<String>) -> Self {
        Self {
            command_type: ViewCommandType::Focus,
            component_id: Some(component_id.into()),
            args: HashMap::new(),
        }
    }

    /// Create a custom command
    pub fn custom(component_id: Option<String>, args: HashMap<String, RuntimeValue>) -> Self {
        Self {
            command_type: ViewCommandType::Custom,
            component_id,
            args,
        }
    }
}

/// View command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewCommandType {
    /// Set a filter on a component
    SetFilter,
    /// Scroll to a position
    ScrollTo,
    /// Focus a component
    Focus,
    /// Custom command
    Custom,
}

/// Suspension details for async extension calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspensionDetails {
    /// Suspension ID for resuming; process-unique, never reused
    pub suspension_id: String,

    /// Extension name (e.g. `http`)
    pub extension_name: String,

    /// Method name (e.g. `get`)
    pub method: String,

    /// Method arguments
    pub args: Vec<RuntimeValue>,
}

/// Resolution of an async extension call, supplied by the host on resume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Resolution {
    /// The extension call succeeded
    Ok {
        /// Value returned to the awaiting script expression
        value: RuntimeValue,
    },
    /// The extension call failed
    Err {
        /// Error message raised into the script as a catchable exception
        message: String,
    },
}

impl Resolution {
    /// Create a success resolution
    pub fn ok(value: RuntimeValue) -> Self {
        Resolution::Ok { value }
    }

    /// Create an error resolution
    pub fn err(message: impl Into<String>) -> Self {
        Resolution::Err {
            message: message.into(),
        }
    }
}

/// Result returned from handler execution.
///
/// The effect buffer and the chosen status arm are produced together at
/// every boundary crossing: a suspended result carries every effect
/// produced before the suspension, and the following resume's result
/// carries only what came after.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WasmResult {
    /// Execution status
    pub status: ExecutionStatus,

    /// Return value (if status is `success`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<RuntimeValue>,

    /// Effects in production order
    pub effects: Vec<Effect>,

    /// Suspension details (if status is `suspended`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspension: Option<SuspensionDetails>,

    /// Error details (if status is `error`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HandlerError>,

    /// Captured `$log` output (out-of-band of the effect buffer)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogMessage>,

    /// Execution metrics
    pub metrics: ExecutionMetrics,
}

impl WasmResult {
    /// Create a success result
    pub fn success(return_value: Option<RuntimeValue>, metrics: ExecutionMetrics) -> Self {
        Self {
            status: ExecutionStatus::Success,
            return_value,
            effects: Vec::new(),
            suspension: None,
            error: None,
            logs: Vec::new(),
            metrics,
        }
    }

    /// Create an error result
    pub fn error(error: HandlerError, metrics: ExecutionMetrics) -> Self {
        Self {
            status: ExecutionStatus::Error,
            return_value: None,
            effects: Vec::new(),
            suspension: None,
            error: Some(error),
            logs: Vec::new(),
            metrics,
        }
    }

    /// Create a suspended result
    pub fn suspended(suspension: SuspensionDetails, metrics: ExecutionMetrics) -> Self {
        Self {
            status: ExecutionStatus::Suspended,
            return_value: None,
            effects: Vec::new(),
            suspension: Some(suspension),
            error: None,
            logs: Vec::new(),
            metrics,
        }
    }

    /// Attach effects
    pub fn with_effects(mut self, effects: Vec<Effect>) -> Self {
        self.effects = effects;
        self
    }

    /// Attach captured logs
    pub fn with_logs(mut self, logs: Vec<LogMessage>) -> Self {
        self.logs = logs;
        self
    }

    /// State mutations in the effect buffer, in order
    pub fn state_mutations(&self) -> impl Iterator<Item = &StateMutation> {
        self.effects.iter().filter_map(|e| match e {
            Effect::State(m) => Some(m),
            _ => None,
        })
    }

    /// Events in the effect buffer, in order
    pub fn events(&self) -> impl Iterator<Item = &EmittedEvent> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Event(ev) => Some(ev),
            _ => None,
        })
    }

    /// View commands in the effect buffer, in order
    pub fn view_commands(&self) -> impl Iterator<Item = &ViewCommand> {
        self.effects.iter().filter_map(|e| match e {
            Effect::View(c) => Some(c),
            _ => None,
        })
    }
}

/// Log levels for `$log` output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level
    Error,
}

impl From<i32> for LogLevel {
    fn from(level: i32) -> Self {
        match level {
            0 => LogLevel::Debug,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// A captured `$log` line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    /// Log level
    pub level: LogLevel,

    /// Message content
    pub message: String,
}

/// Suspension recorded by `ext_suspend` pending instance park
#[derive(Debug, Clone)]
pub struct SuspensionState {
    /// Suspension ID
    pub id: String,

    /// Extension name
    pub extension_name: String,

    /// Method name
    pub method: String,

    /// Arguments
    pub args: Vec<RuntimeValue>,
}

/// Mutable execution context shared between an instance and the host ABI
/// for the duration of an invocation (including across suspensions).
#[derive(Debug)]
pub struct ExecutionContext {
    /// Panel ID
    pub panel_id: String,

    /// Handler name
    pub handler_name: String,

    /// Write-through state mirror: seeded from the snapshot, updated by
    /// `set`/`delete` so reads within the same invocation see mutations.
    pub state: HashMap<String, RuntimeValue>,

    /// Computed state keys (write-rejected)
    pub computed_keys: HashSet<String>,

    /// Arguments
    pub args: HashMap<String, RuntimeValue>,

    /// Scope variables
    pub scope: HashMap<String, RuntimeValue>,

    /// Capability checker over the granted tokens
    pub capabilities: CapabilityChecker,

    /// Extension registry
    pub extension_registry: HashMap<String, Vec<String>>,

    /// Effect buffer, drained at every boundary crossing
    pub effects: Vec<Effect>,

    /// Captured log lines, drained with the effects
    pub logs: Vec<LogMessage>,

    /// Per-ABI-function call counts for metrics
    pub host_call_counts: HashMap<&'static str, u32>,

    /// Armed resource limits and counters
    pub enforcer: ResourceEnforcer,

    /// Pending suspension recorded by `ext_suspend`
    pub suspension: Option<SuspensionState>,
}

/// Shared handle to the execution context.
///
/// The ABI functions and the engine binding both hold this; control is
/// single-threaded within an instance, the lock only bridges the host and
/// guest sides of one call stack.
pub type SharedContext = Arc<Mutex<ExecutionContext>>;

impl ExecutionContext {
    /// Build an execution context from a handler context and armed limits
    pub fn new(ctx: HandlerContext, limits: ExecutionLimits) -> Self {
        Self {
            panel_id: ctx.panel_id,
            handler_name: ctx.handler_name,
            state: ctx.state_snapshot,
            computed_keys: ctx.computed_keys,
            args: ctx.args,
            scope: ctx.scope,
            capabilities: CapabilityChecker::new(ctx.capabilities),
            extension_registry: ctx.extension_registry,
            effects: Vec::new(),
            logs: Vec::new(),
            host_call_counts: HashMap::new(),
            enforcer: ResourceEnforcer::new(limits),
            suspension: None,
        }
    }

    /// Wrap into a shared handle
    pub fn into_shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }

    /// Record a set mutation: effect buffer plus write-through mirror
    pub fn apply_set(&mut self, key: &str, value: RuntimeValue) {
        self.state.insert(key.to_string(), value.clone());
        self.effects.push(Effect::State(StateMutation::set(key, value)));
    }

    /// Record a delete mutation: effect buffer plus write-through mirror
    pub fn apply_delete(&mut self, key: &str) {
        self.state.remove(key);
        self.effects.push(Effect::State(StateMutation::delete(key)));
    }

    /// Record an emitted event
    pub fn push_event(&mut self, event: EmittedEvent) {
        self.effects.push(Effect::Event(event));
    }

    /// Record a view command
    pub fn push_view_command(&mut self, command: ViewCommand) {
        self.effects.push(Effect::View(command));
    }

    /// Record a log line
    pub fn push_log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogMessage { level, message });
    }

    /// Note one call of a named ABI function for metrics
    pub fn count_host_call(&mut self, name: &'static str) {
        *self.host_call_counts.entry(name).or_insert(0) += 1;
    }

    /// Drain the effect buffer for delivery at a boundary crossing
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Drain the captured logs for delivery at a boundary crossing
    pub fn take_logs(&mut self) -> Vec<LogMessage> {
        std::mem::take(&mut self.logs)
    }

    /// Replace the state mirror with a refreshed host snapshot
    pub fn refresh_state(&mut self, snapshot: HashMap<String, RuntimeValue>) {
        self.state = snapshot;
    }
}
