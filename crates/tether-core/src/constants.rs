//! Protocol and configuration constants for tether.

use std::time::Duration;

// =============================================================================
// Transport Constants
// =============================================================================

/// Timeout for dialing the Hub.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle period without inbound frames before the transport sends a
/// keep-alive PING.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Grace period after a keep-alive PING before the connection is failed.
pub const KEEPALIVE_GRACE: Duration = Duration::from_secs(10);

// =============================================================================
// Heartbeat Constants
// =============================================================================

/// Interval between application-level PING messages to the Hub.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Maximum age of the last PONG before the session is failed.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Reconnect Constants
// =============================================================================

/// Initial reconnect backoff delay.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Maximum reconnect backoff delay.
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// A session that lasted at least this long resets the backoff to the
/// initial delay.
pub const HEALTHY_SESSION: Duration = Duration::from_secs(60);

/// How often the supervisor re-checks an incomplete configuration.
pub const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(3);

// =============================================================================
// Exec Constants
// =============================================================================

/// Default command timeout when the request does not specify one.
pub const DEFAULT_EXEC_TIMEOUT_MS: i64 = 30_000;

/// Exit code reported when the command deadline fires.
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// Initial stdout line buffer size.
pub const LINE_BUFFER_INITIAL: usize = 64 * 1024;

/// Maximum stdout line length before the stream is abandoned.
pub const LINE_BUFFER_MAX: usize = 1024 * 1024;

/// Maximum captured stderr bytes; output beyond this is truncated.
pub const STDERR_CAP: usize = 100 * 1024;

// =============================================================================
// File Operation Constants
// =============================================================================

/// Default maximum readable file size.
pub const DEFAULT_MAX_FILE_SIZE: i64 = 256 * 1024;

/// Default maximum number of lines returned by a read.
pub const DEFAULT_LINE_LIMIT: i64 = 2000;

// =============================================================================
// Browser Bridge Constants
// =============================================================================

/// Default local port for the browser bridge.
pub const DEFAULT_BROWSER_PORT: u16 = 19824;

/// Interval between SSE heartbeat events to the extension.
pub const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Default timeout for a browser command awaiting its result.
pub const BROWSER_CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum accepted `/result` body size.
pub const RESULT_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Deadline for the bridge's graceful HTTP shutdown.
pub const BRIDGE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

// =============================================================================
// Management Panel Constants
// =============================================================================

/// Default local port for the management panel.
pub const DEFAULT_WEB_PORT: u16 = 19800;

/// Maximum accepted config update body size.
pub const CONFIG_BODY_LIMIT: usize = 64 * 1024;

/// Deadline for the panel's graceful HTTP shutdown.
pub const WEB_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Logging Constants
// =============================================================================

/// Number of log entries retained in the ring buffer.
pub const LOG_BUFFER_SIZE: usize = 1000;

/// Capacity of each log subscriber channel; entries are dropped when full.
pub const LOG_SUBSCRIBER_CAPACITY: usize = 100;
