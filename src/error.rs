//! Error taxonomy for sandbox operations.

use thiserror::Error;

/// Main error type for session, execution and debug operations.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The requested language has no entry in the language table.
    #[error("Language '{0}' is not supported")]
    UnsupportedLanguage(String),

    /// The session id is unknown or the session is no longer active.
    #[error("Session not found or inactive: {0}")]
    SessionNotFound(String),

    /// Container engine failure.
    #[error("Container fault: {0}")]
    ContainerFault(String),

    /// A foreground command exceeded its wall-clock budget.
    #[error("Execution timed out after {timeout_ms} ms")]
    ExecutionTimeout { timeout_ms: u64 },

    /// Code exceeds the configured size limit.
    #[error("Code size {size} bytes exceeds maximum of {limit} bytes")]
    CodeTooLarge { size: usize, limit: usize },

    /// The debug server never accepted a connection within the retry budget.
    #[error("Debugger at {address} unreachable after {attempts} attempts")]
    DebuggerUnreachable { address: String, attempts: u32 },

    /// The debug adapter rejected a request, or the connection dropped before it answered.
    #[error("Debug command '{command}' failed: {message}")]
    DebugCommandFailed { command: String, message: String },

    /// No debug session with this id belongs to the caller.
    #[error("Debug session not found: {0}")]
    DebugSessionNotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandboxError {
    /// Whether the error was caused by bad caller input rather than infrastructure.
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedLanguage(_)
                | Self::SessionNotFound(_)
                | Self::CodeTooLarge { .. }
                | Self::DebugSessionNotFound(_)
        )
    }

    pub(crate) fn container(err: impl std::fmt::Display) -> Self {
        Self::ContainerFault(err.to_string())
    }
}

/// Type alias for Results that return `SandboxError`
pub type Result<T> = std::result::Result<T, SandboxError>;
