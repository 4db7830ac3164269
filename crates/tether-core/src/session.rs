//! Session state types shared between the supervisor and its observers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{BACKOFF_INITIAL, BACKOFF_MAX, HEALTHY_SESSION};

/// Connection state of the supervised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not running, or waiting for a complete configuration.
    Stopped,
    /// A session attempt is dialing the Hub.
    Connecting,
    /// The stream is up and messages flow.
    Connected,
    /// The last attempt failed; backoff is pending.
    Reconnecting,
    /// Unrecoverable error (currently unused by the supervisor loop).
    Error,
}

impl ConnectionState {
    /// Whether a session attempt is in flight or pending.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting
        )
    }
}

/// Point-in-time snapshot of the supervisor, returned by value so
/// observers never hold a live view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uptime: String,
    pub reconnects: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub computer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub browser: String,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: ConnectionState::Stopped,
            connected_at: None,
            uptime: String::new(),
            reconnects: 0,
            last_error: String::new(),
            computer: String::new(),
            browser: String::new(),
        }
    }
}

/// Format an uptime duration as seconds, `XmYs`, or `XhYm`.
pub fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Reconnect backoff: 1 s doubling to a 30 s cap, reset to 1 s after any
/// session that stayed up at least 60 s.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            next: BACKOFF_INITIAL,
        }
    }

    /// Delay to sleep after a failed attempt whose session lasted
    /// `session_len`. Advances the internal schedule.
    pub fn delay_after(&mut self, session_len: Duration) -> Duration {
        if session_len >= HEALTHY_SESSION {
            self.next = BACKOFF_INITIAL;
        }
        let delay = self.next;
        self.next = (self.next * 2).min(BACKOFF_MAX);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_activity() {
        assert!(!ConnectionState::Stopped.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Connected.is_active());
        assert!(ConnectionState::Reconnecting.is_active());
        assert!(!ConnectionState::Error.is_active());
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0s");
        assert_eq!(format_uptime(Duration::from_secs(59)), "59s");
        assert_eq!(format_uptime(Duration::from_secs(60)), "1m0s");
        assert_eq!(format_uptime(Duration::from_secs(125)), "2m5s");
        assert_eq!(format_uptime(Duration::from_secs(3600)), "1h0m");
        assert_eq!(format_uptime(Duration::from_secs(3725)), "1h2m");
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = Backoff::new();
        let short = Duration::from_secs(5);
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.delay_after(short).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn backoff_resets_after_healthy_session() {
        let mut backoff = Backoff::new();
        let short = Duration::from_secs(5);
        backoff.delay_after(short);
        backoff.delay_after(short);
        assert_eq!(backoff.delay_after(short), Duration::from_secs(4));

        // A session of 60s or more is a fresh incident
        assert_eq!(
            backoff.delay_after(Duration::from_secs(60)),
            Duration::from_secs(1)
        );
        assert_eq!(backoff.delay_after(short), Duration::from_secs(2));
    }

    #[test]
    fn status_serializes_state_lowercase() {
        let status = Status {
            state: ConnectionState::Reconnecting,
            reconnects: 3,
            last_error: "Pong 超时 (11s)".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "reconnecting");
        assert_eq!(json["reconnects"], 3);
        assert_eq!(json["last_error"], "Pong 超时 (11s)");
        // connected_at/uptime omitted while down
        assert!(json.get("connected_at").is_none());
        assert!(json.get("uptime").is_none());
    }
}
