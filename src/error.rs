//! Error types for the handler runtime.
//!
//! The taxonomy is closed: every failure a handler execution can produce is
//! one of the [`ErrorCode`] variants, carried in a serializable
//! [`HandlerError`]. Host-level failures (configuration, I/O, admission)
//! use [`RuntimeError`] and never reach a `WasmResult`.

use serde::{Deserialize, Serialize};

/// Error codes for handler-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Handler source failed to compile
    CompileError,
    /// Handler exceeded its wall-clock budget (on-CPU time)
    Timeout,
    /// Handler exceeded the per-instance memory ceiling
    MemoryLimit,
    /// A bounded resource counter was exceeded (see [`ResourceKind`])
    ResourceLimit,
    /// Handler invoked an extension method it was not granted
    PermissionDenied,
    /// Uncaught exception inside the script
    ExecutionError,
    /// Host-initiated or shutdown-initiated cancellation
    Cancelled,
    /// The runtime is unable to continue
    Fatal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::CompileError => write!(f, "COMPILE_ERROR"),
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::MemoryLimit => write!(f, "MEMORY_LIMIT"),
            ErrorCode::ResourceLimit => write!(f, "RESOURCE_LIMIT"),
            ErrorCode::PermissionDenied => write!(f, "PERMISSION_DENIED"),
            ErrorCode::ExecutionError => write!(f, "EXECUTION_ERROR"),
            ErrorCode::Cancelled => write!(f, "CANCELLED"),
            ErrorCode::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Which bounded resource a `ResourceLimit` error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Per-invocation host ABI call ceiling
    HostCalls,
    /// Per-invocation state mutation ceiling
    StateMutations,
    /// Per-invocation event emission ceiling
    Events,
    /// Resume targeted a suspension ID that does not exist
    UnknownSuspension,
    /// Resume targeted a suspension ID that was already honored
    AlreadyResumed,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::HostCalls => write!(f, "host-calls"),
            ResourceKind::StateMutations => write!(f, "state-mutations"),
            ResourceKind::Events => write!(f, "events"),
            ResourceKind::UnknownSuspension => write!(f, "unknown-suspension"),
            ResourceKind::AlreadyResumed => write!(f, "already-resumed"),
        }
    }
}

/// Why a `Fatal` error was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FatalKind {
    /// The runtime is shutting down
    ShuttingDown,
    /// An internal invariant was violated
    Invariant,
}

/// Source location in handler code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    /// Line number (1-indexed)
    pub line: u32,
    /// Column number (1-indexed)
    pub column: u32,
}

impl SourceLocation {
    /// Create a new source location
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Code snippet around an error location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSnippet {
    /// The snippet text
    pub code: String,
    /// The line to highlight (1-indexed relative to the snippet)
    pub highlight_line: u32,
}

/// Structured error delivered to the host inside a `WasmResult`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerError {
    /// Error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Resource kind (if code is `ResourceLimit`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceKind>,

    /// Capability that was missing (if code is `PermissionDenied`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,

    /// Fatal kind (if code is `Fatal`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<FatalKind>,

    /// Script stack trace, if the engine produced one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Source location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,

    /// Handler source snippet around the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<CodeSnippet>,
}

impl HandlerError {
    /// Create a new handler error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            resource: None,
            capability: None,
            fatal: None,
            stack: None,
            location: None,
            snippet: None,
        }
    }

    /// Create a compile error
    pub fn compile(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CompileError, message)
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u32) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("handler exceeded {}ms time budget", timeout_ms),
        )
    }

    /// Create a memory limit error
    pub fn memory_limit(limit_bytes: u64) -> Self {
        Self::new(
            ErrorCode::MemoryLimit,
            format!("handler exceeded {} byte memory ceiling", limit_bytes),
        )
    }

    /// Create a resource limit error
    pub fn resource_limit(kind: ResourceKind, detail: impl Into<String>) -> Self {
        let mut err = Self::new(
            ErrorCode::ResourceLimit,
            format!("resource limit exceeded: {} ({})", kind, detail.into()),
        );
        err.resource = Some(kind);
        err
    }

    /// Create a permission denied error
    pub fn permission_denied(capability: impl Into<String>) -> Self {
        let capability = capability.into();
        let mut err = Self::new(
            ErrorCode::PermissionDenied,
            format!("permission denied: requires capability '{}'", capability),
        );
        err.capability = Some(capability);
        err
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionError, message)
    }

    /// Create a cancellation error
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, format!("cancelled: {}", reason.into()))
    }

    /// Create a fatal error
    pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCode::Fatal, message);
        err.fatal = Some(kind);
        err
    }

    /// Add a script stack trace
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Add a source location
    pub fn with_location(mut self, line: u32, column: u32) -> Self {
        self.location = Some(SourceLocation::new(line, column));
        self
    }

    /// Add a source snippet
    pub fn with_snippet(mut self, code: impl Into<String>, highlight_line: u32) -> Self {
        self.snippet = Some(CodeSnippet {
            code: code.into(),
            highlight_line,
        });
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(loc) = &self.location {
            write!(f, " at line {}:{}", loc.line, loc.column)?;
        }
        Ok(())
    }
}

impl std::error::Error for HandlerError {}

/// Failure of a single host ABI call, as seen by the engine binding.
///
/// Terminal faults unwind the instance; script-visible faults are surfaced
/// to the handler as a catchable exception by the bootstrap.
#[derive(Debug, Clone, PartialEq)]
pub enum AbiFault {
    /// Wall-clock budget exceeded (terminal)
    Timeout,
    /// A bounded counter was exceeded (terminal)
    ResourceLimit(ResourceKind),
    /// Missing capability or unregistered extension method (terminal)
    PermissionDenied(String),
    /// Write to a computed state key (script-visible)
    ReadOnlyComputed(String),
    /// Malformed buffer crossing the boundary (script-visible)
    Codec(String),
}

impl AbiFault {
    /// Whether this fault unwinds the instance rather than surfacing as a
    /// catchable script exception.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AbiFault::Timeout | AbiFault::ResourceLimit(_) | AbiFault::PermissionDenied(_)
        )
    }

    /// The ABI status code reported to the guest for this fault
    pub fn status_code(&self) -> i32 {
        match self {
            AbiFault::Timeout => status::TIMEOUT,
            AbiFault::ResourceLimit(_) => status::RESOURCE_LIMIT,
            AbiFault::PermissionDenied(_) => status::PERMISSION_DENIED,
            AbiFault::ReadOnlyComputed(_) => status::READ_ONLY_COMPUTED,
            AbiFault::Codec(_) => status::INVALID_ARGUMENT,
        }
    }
}

impl From<AbiFault> for HandlerError {
    fn from(fault: AbiFault) -> Self {
        match fault {
            AbiFault::Timeout => {
                HandlerError::new(ErrorCode::Timeout, "handler exceeded time budget")
            }
            AbiFault::ResourceLimit(kind) => {
                HandlerError::resource_limit(kind, "per-invocation ceiling")
            }
            AbiFault::PermissionDenied(capability) => HandlerError::permission_denied(capability),
            AbiFault::ReadOnlyComputed(key) => {
                HandlerError::execution(format!("cannot write computed state key '{}'", key))
            }
            AbiFault::Codec(msg) => {
                HandlerError::execution(format!("malformed ABI buffer: {}", msg))
            }
        }
    }
}

impl std::fmt::Display for AbiFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbiFault::Timeout => write!(f, "timeout"),
            AbiFault::ResourceLimit(kind) => write!(f, "resource-limit({})", kind),
            AbiFault::PermissionDenied(cap) => write!(f, "permission-denied({})", cap),
            AbiFault::ReadOnlyComputed(key) => write!(f, "read-only-computed({})", key),
            AbiFault::Codec(msg) => write!(f, "codec({})", msg),
        }
    }
}

/// Result type for host ABI calls
pub type AbiResult<T> = std::result::Result<T, AbiFault>;

/// Main error type for host-facing runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Handler-level error surfaced through the embedding API
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Pool saturated and the acquire timeout elapsed
    #[error("runtime busy: no instance available")]
    Busy,

    /// The runtime is shutting down
    #[error("runtime is shutting down")]
    ShuttingDown,

    /// Instance-level error (invalid state transitions, engine failures)
    #[error("instance error: {0}")]
    Instance(String),

    /// Engine binding error (module load, instantiation)
    #[error("engine error: {0}")]
    Engine(String),
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RuntimeError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RuntimeError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RuntimeError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RuntimeError::Serialization(e.to_string())
    }
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Integer status codes for ABI calls crossing the WASM boundary.
///
/// These report success or failure of the ABI call itself, never the
/// application semantics.
pub mod status {
    /// Success
    pub const SUCCESS: i32 = 0;
    /// Permission denied
    pub const PERMISSION_DENIED: i32 = -1;
    /// Resource limit exceeded
    pub const RESOURCE_LIMIT: i32 = -2;
    /// Invalid argument or malformed buffer
    pub const INVALID_ARGUMENT: i32 = -3;
    /// Not found
    pub const NOT_FOUND: i32 = -4;
    /// Write to a computed state key
    pub const READ_ONLY_COMPUTED: i32 = -5;
    /// Time budget exceeded
    pub const TIMEOUT: i32 = -6;
}
