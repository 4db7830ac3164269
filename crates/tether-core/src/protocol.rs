//! Wire protocol between the agent and the Hub.
//!
//! Both directions carry one JSON envelope per transport frame: a
//! `request_id` plus an internally tagged payload. Replies echo the
//! `request_id` of the request they answer; unsolicited messages
//! (registration, ping) leave it empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Inbound (Hub → agent)
// =============================================================================

/// Envelope for messages received from the Hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEnvelope {
    /// Correlation id; echoed back on every reply to this request.
    #[serde(default)]
    pub request_id: String,
    /// The request payload.
    #[serde(flatten)]
    pub payload: HubPayload,
}

/// Inbound payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubPayload {
    /// Run a shell command with streamed stdout.
    Exec(ExecRequest),
    /// Read a range of lines from a file.
    ReadFile(ReadFileRequest),
    /// Write a file, creating parent directories.
    WriteFile(WriteFileRequest),
    /// In-place find/replace in a file.
    EditFile(EditFileRequest),
    /// Forward a command to the browser extension.
    BrowserExec(BrowserExecRequest),
    /// Heartbeat reply; refreshes the liveness clock.
    Pong(Pong),
}

/// Shell execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    /// Working directory; empty means the user's home.
    #[serde(default)]
    pub workdir: String,
    /// Deadline in milliseconds; zero or negative means the default.
    #[serde(default)]
    pub timeout_ms: i64,
}

/// File read request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
    /// Number of leading lines to skip.
    #[serde(default)]
    pub offset: i64,
    /// Maximum lines to return; zero or negative means the default.
    #[serde(default)]
    pub limit: i64,
    /// Maximum file size in bytes; zero or negative means the default.
    #[serde(default)]
    pub max_size: i64,
}

/// File write request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
}

/// File edit (find/replace) request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditFileRequest {
    pub path: String,
    pub old_string: String,
    pub new_string: String,
    #[serde(default)]
    pub replace_all: bool,
}

/// Browser command forwarded to the extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserExecRequest {
    /// Opaque command JSON; already carries the extension-facing `id`.
    pub command_json: String,
    /// Deadline in milliseconds; zero or negative means the default.
    #[serde(default)]
    pub timeout_ms: i64,
}

/// Heartbeat reply from the Hub. Carries no data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pong {}

// =============================================================================
// Outbound (agent → Hub)
// =============================================================================

/// Envelope for messages sent to the Hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEnvelope {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(flatten)]
    pub payload: AgentPayload,
}

impl AgentEnvelope {
    /// Build a reply envelope correlated to `request_id`.
    pub fn reply(request_id: impl Into<String>, payload: AgentPayload) -> Self {
        Self {
            request_id: request_id.into(),
            payload,
        }
    }

    /// Build an unsolicited envelope (registration, ping).
    pub fn unsolicited(payload: AgentPayload) -> Self {
        Self {
            request_id: String::new(),
            payload,
        }
    }
}

/// Outbound payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentPayload {
    /// Computer role announcement, sent once per session.
    Registration(Registration),
    /// Browser role announcement; also signals extension online/offline.
    BrowserRegistration(BrowserRegistration),
    /// Application-level heartbeat.
    Ping(Ping),
    /// Shell output chunk or terminal result.
    ExecOutput(ExecOutput),
    /// File read reply.
    FileContent(FileContent),
    /// File write/edit reply.
    OpResult(OpResult),
    /// Browser command reply.
    BrowserExecOutput(BrowserExecOutput),
}

/// Computer registration sent right after the stream opens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub computer_id: String,
    pub description: String,
    pub os: String,
    pub arch: String,
    pub shell: String,
    pub home_dir: String,
    /// Detected tool name → first line of its version output.
    pub tools: BTreeMap<String, String>,
    pub allowed_paths: Vec<String>,
    pub token: String,
}

/// Browser registration; `online` tracks the extension connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserRegistration {
    pub browser_id: String,
    pub description: String,
    pub online: bool,
}

/// Application-level heartbeat with the sender's wall clock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

/// Shell execution output.
///
/// Streaming chunks set only `stdout`; the terminal message sets
/// `done=true` and carries `stderr`, `exit_code`, and the effective
/// `workdir`. Exactly one message per request has `done=true` and it is
/// the last one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub workdir: String,
}

/// File read reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
    pub total_lines: i64,
    pub file_size: i64,
    pub error: String,
}

/// Generic operation reply for writes and edits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    pub success: bool,
    pub error: String,
}

/// Browser command reply; `result_json` is the raw body posted by the
/// extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserExecOutput {
    pub result_json: String,
    pub error: String,
    pub done: bool,
}

// =============================================================================
// Encoding
// =============================================================================

impl HubEnvelope {
    /// Decode an inbound frame.
    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| Error::SizeFormat {
            message: format!("无法解析消息: {e}"),
        })
    }
}

impl AgentEnvelope {
    /// Encode an outbound frame.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SizeFormat {
            message: format!("无法编码消息: {e}"),
        })
    }
}
