//! Error types for tether-core.

use thiserror::Error;

/// Main error type for tether operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or malformed argument in a request.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Path rejected by the allow-list.
    #[error("permission denied: {path}")]
    Permission { path: String },

    /// File or directory does not exist.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// Payload or file exceeds a size limit, or has the wrong shape.
    #[error("size/format error: {message}")]
    SizeFormat { message: String },

    /// Transport layer failure (dial, send, receive).
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Heartbeat liveness failure (pong timeout).
    #[error("liveness error: {message}")]
    Liveness { message: String },

    /// Command finished with a non-zero exit code.
    #[error("command failed with exit code {exit_code}")]
    Command { exit_code: i32 },

    /// Configuration file could not be read or parsed.
    #[error("config error: {message}")]
    Config { message: String },

    /// Contained panic, broken pipe, or other internal failure.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is transient and a session reconnect may help.
    ///
    /// Transient errors are transport/liveness failures where the Hub may
    /// still be reachable on the next attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Liveness { .. } | Error::Io(_)
        )
    }

    /// Shorthand for a transport error with a formatted message.
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    /// Shorthand for an internal error with a formatted message.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }
}

/// Convenience result type for tether operations.
pub type Result<T> = std::result::Result<T, Error>;
