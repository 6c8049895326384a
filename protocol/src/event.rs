//! The canonical event schema.
//!
//! Every adapter-specific record is normalized into an [`Event`] before it is
//! stored or delivered to a subscriber. `seq` is the ordering and dedup key:
//! per session it is strictly increasing, gap-free, and assigned by the event
//! store at append time.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::ExecutorKind;

/// A persisted, normalized event for one session.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Event {
    pub session_id: String,

    /// Which agent produced this event.
    pub executor: ExecutorKind,

    /// Per-session monotonic sequence number, starting at 1. Zero means
    /// "not yet appended" — the store assigns the real value.
    pub seq: u64,

    /// Wall clock at append time. The store stamps this if the transformer
    /// left it at the epoch.
    pub timestamp: DateTime<Utc>,

    /// Coarse classification used for routing and terminal detection.
    #[serde(rename = "type")]
    pub kind: EventKind,

    pub content: EventContent,
}

impl Event {
    /// `true` for the terminal event of a session. No event with a higher
    /// `seq` is ever stored after it.
    pub fn is_terminal(&self) -> bool {
        self.kind == EventKind::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Message,
    Progress,
    Tool,
    Approval,
    Error,
    Done,
}

/// Normalized payload carried by every [`Event`].
///
/// Fields absent in the adapter output are omitted, never defaulted —
/// callers must not observe a zero-valued `tool_name` or `request_id`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EventContent {
    /// The executor id, e.g. `"claude_code"`.
    pub source: String,

    /// The adapter-chosen tag of the originating log record.
    pub source_type: String,

    pub category: Category,
    pub action: Action,
    pub phase: Phase,

    /// Short human-readable description of the event.
    pub summary: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// The object the tool acted on (file path, pattern, query, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Adapter-assigned id of a pending approval round-trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Raw status string reported by the agent, when one was present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Message or result text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// The unparsed adapter payload, for debugging subscribers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    Lifecycle,
    Message,
    #[default]
    Progress,
    Tool,
    Approval,
    Error,
    Done,
}

/// What the agent is doing, derived from the adapter record (for tool
/// records, by keyword against the tool name).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    Starting,
    #[default]
    Thinking,
    Reading,
    Searching,
    Editing,
    ToolRunning,
    Responding,
    ApprovalRequired,
    Completed,
    Failed,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    #[default]
    Started,
    Delta,
    Requested,
    Completed,
    Failed,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn event_serializes_kind_as_type() {
        let event = Event {
            session_id: "s-1".to_string(),
            executor: ExecutorKind::ClaudeCode,
            seq: 1,
            timestamp: DateTime::UNIX_EPOCH,
            kind: EventKind::Done,
            content: EventContent {
                source: "claude_code".to_string(),
                source_type: "done".to_string(),
                category: Category::Done,
                action: Action::Completed,
                phase: Phase::Completed,
                summary: "done".to_string(),
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "done");
        assert_eq!(value["executor"], "claude_code");
        // Optional fields must be absent, not null.
        assert!(value["content"].get("tool_name").is_none());
        assert!(value["content"].get("request_id").is_none());
    }

    #[test]
    fn event_round_trips() {
        let event = Event {
            session_id: "s-2".to_string(),
            executor: ExecutorKind::Codex,
            seq: 7,
            timestamp: Utc::now(),
            kind: EventKind::Tool,
            content: EventContent {
                source: "codex".to_string(),
                source_type: "codex/event/exec_command_begin".to_string(),
                category: Category::Tool,
                action: Action::ToolRunning,
                phase: Phase::Started,
                summary: "running command".to_string(),
                tool_name: Some("exec_command".to_string()),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
