//! tether-core: shared library for the tether endpoint agent.
//!
//! This crate provides:
//! - Wire protocol envelopes and payloads for the Hub stream
//! - Error taxonomy and result alias
//! - Persisted configuration model and thread-safe store
//! - Path allow-list predicate
//! - Session state, status snapshots, and reconnect backoff
//! - Logging setup and the management panel's log buffer

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod pathguard;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};
pub use logging::{init_logging, LogBuffer, LogEntry, LogLevel};
pub use pathguard::is_path_allowed;
pub use session::{Backoff, ConnectionState, Status};

/// Current wall clock as Unix milliseconds.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
