//! Request and response types of the embedding surface: what a front-end
//! (HTTP/SSE layer, CLI, tests) hands to the session engine and gets back.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// The agent CLIs the harness knows how to drive.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutorKind {
    ClaudeCode,
    Codex,
    Gemini,
    Qwen,
    Copilot,
    Droid,

    /// Not an agent: marks events synthesized by the harness itself, such
    /// as the terminal event reported for an expired or never-started
    /// session. Rejected by `execute`.
    Harness,
}

/// Request to start a new session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecuteRequest {
    pub prompt: String,
    pub executor: ExecutorKind,

    /// Working directory for the agent process. Defaults to the harness
    /// process cwd.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Plan mode: the agent proposes rather than executes, and tool use
    /// requires interactive approval.
    #[serde(default)]
    pub plan: bool,

    /// Agent-specific sandbox selector, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,

    /// Approval policy selector. Empty or `"never"` disables the
    /// interactive approval round-trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_for_approval: Option<String>,

    /// Extra environment for the child process. Overrides win over the
    /// inherited environment and the adapter defaults.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecuteResponse {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Done,
    Interrupted,
}

/// One row of `list_sessions`, sorted by `updated_at` descending.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub executor: ExecutorKind,
    pub status: SessionStatus,

    /// First 36 characters of the trimmed prompt.
    pub title: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Options for a live subscription.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct SubscribeOptions {
    /// Replay stored history before the live stream.
    #[serde(default)]
    pub return_all: bool,

    /// Include raw passthrough events (unparsed agent stdout).
    #[serde(default)]
    pub include_debug: bool,

    /// Only events with `seq` strictly greater than this are delivered.
    #[serde(default)]
    pub after_seq: u64,

    /// Cap on replayed history (0 = unlimited). Live events are not
    /// limited.
    #[serde(default)]
    pub limit: usize,
}

/// The user's verdict on a pending approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ControlDecision {
    Approve,
    Deny,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlResponse {
    /// Adapter-assigned id of the approval request being answered.
    pub request_id: String,
    pub decision: ControlDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
