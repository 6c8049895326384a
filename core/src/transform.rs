//! Event normalization: `(executor, Log) → Event`.
//!
//! Each executor has its own transformer; tags with shared meaning
//! (`done`, `error`, `stderr`, `control_request`, `command`, `stdout`) are
//! handled once for all of them, and anything unrecognized falls back to a
//! progress record. Transformers are deterministic and side-effect free;
//! fields absent in the adapter output are omitted, never defaulted.
//!
//! The returned event carries `seq = 0` and an epoch timestamp — both are
//! assigned by the store at append time.

use chrono::DateTime;
use corral_protocol::Action;
use corral_protocol::Category;
use corral_protocol::Event;
use corral_protocol::EventContent;
use corral_protocol::EventKind;
use corral_protocol::ExecutorKind;
use corral_protocol::Phase;
use serde_json::Value;

use crate::adapters::Log;
use crate::adapters::log_kinds;

pub fn transform(session_id: &str, executor: ExecutorKind, log: &Log) -> Event {
    let mut content = shared_content(log).unwrap_or_else(|| match executor {
        ExecutorKind::ClaudeCode => claude_content(log),
        ExecutorKind::Codex => codex_content(log),
        ExecutorKind::Gemini | ExecutorKind::Qwen | ExecutorKind::Copilot => acp_content(log),
        ExecutorKind::Droid => droid_content(log),
        ExecutorKind::Harness => default_content(log),
    });

    content.source = executor.to_string();
    content.source_type = log.kind.clone();
    if content.summary.is_empty() {
        content.summary = default_summary(content.category).to_string();
    }

    Event {
        session_id: session_id.to_string(),
        executor,
        seq: 0,
        timestamp: DateTime::UNIX_EPOCH,
        kind: kind_for_category(content.category),
        content,
    }
}

fn kind_for_category(category: Category) -> EventKind {
    match category {
        Category::Lifecycle | Category::Progress => EventKind::Progress,
        Category::Message => EventKind::Message,
        Category::Tool => EventKind::Tool,
        Category::Approval => EventKind::Approval,
        Category::Error => EventKind::Error,
        Category::Done => EventKind::Done,
    }
}

/// Rules shared by every adapter, applied before the per-executor ones.
fn shared_content(log: &Log) -> Option<EventContent> {
    let content = &log.content;
    match log.kind.as_str() {
        log_kinds::DONE => Some(EventContent {
            category: Category::Done,
            action: Action::Completed,
            phase: Phase::Completed,
            ..Default::default()
        }),
        log_kinds::STDERR | log_kinds::ERROR => {
            let text = extract_text(content);
            Some(EventContent {
                category: Category::Error,
                action: Action::Failed,
                phase: Phase::Failed,
                summary: text.clone().unwrap_or_default(),
                text,
                ..Default::default()
            })
        }
        log_kinds::CONTROL_REQUEST => {
            let request_id = extract_request_id(content);
            let tool_name = extract_tool_name(content);
            Some(EventContent {
                category: Category::Approval,
                action: Action::ApprovalRequired,
                phase: Phase::Requested,
                summary: match &tool_name {
                    Some(tool) => format!("approval required: {tool}"),
                    None => "approval required".to_string(),
                },
                tool_name,
                target: extract_target(content),
                request_id,
                ..Default::default()
            })
        }
        log_kinds::COMMAND => {
            let command = content
                .get("command")
                .and_then(Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();
            Some(EventContent {
                category: Category::Lifecycle,
                action: Action::Starting,
                phase: Phase::Started,
                summary: if command.is_empty() {
                    String::new()
                } else {
                    format!("launching {command}")
                },
                ..Default::default()
            })
        }
        log_kinds::STDOUT => {
            let text = extract_text(content);
            Some(EventContent {
                category: Category::Progress,
                action: Action::Thinking,
                phase: Phase::Delta,
                summary: text.clone().unwrap_or_default(),
                text,
                raw: Some(content.clone()),
                ..Default::default()
            })
        }
        _ => None,
    }
}

fn claude_content(log: &Log) -> EventContent {
    let content = &log.content;
    match log.kind.as_str() {
        log_kinds::RESULT => {
            let text = content
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string);
            EventContent {
                category: Category::Message,
                action: Action::Responding,
                phase: Phase::Completed,
                summary: text.clone().unwrap_or_default(),
                text,
                ..Default::default()
            }
        }
        "tool_use" => tool_content(content, &log.kind, Phase::Started),
        "tool_result" => {
            let phase = phase_from_status(content);
            tool_content(content, &log.kind, phase)
        }
        _ => default_content(log),
    }
}

fn codex_content(log: &Log) -> EventContent {
    let content = &log.content;
    match log.kind.as_str() {
        "codex/event/task_started" => EventContent {
            category: Category::Progress,
            action: Action::Thinking,
            phase: Phase::Started,
            summary: "task started".to_string(),
            ..Default::default()
        },
        "codex/event/task_complete" => EventContent {
            category: Category::Done,
            action: Action::Completed,
            phase: Phase::Completed,
            ..Default::default()
        },
        "codex/event/agent_message" => {
            let text = extract_text(content);
            EventContent {
                category: Category::Message,
                action: Action::Responding,
                phase: Phase::Delta,
                summary: text.clone().unwrap_or_default(),
                text,
                ..Default::default()
            }
        }
        "codex/event/mcp_startup" => {
            let target = content
                .get("server")
                .or_else(|| content.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            EventContent {
                category: Category::Lifecycle,
                action: Action::Starting,
                phase: Phase::Started,
                summary: match &target {
                    Some(server) => format!("starting {server}"),
                    None => String::new(),
                },
                target,
                ..Default::default()
            }
        }
        kind => match kind.strip_prefix("codex/event/") {
            Some(event) if is_codex_tool_event(event) => {
                let phase = phase_from_status(content);
                tool_content(content, kind, phase)
            }
            _ => default_content(log),
        },
    }
}

fn is_codex_tool_event(event: &str) -> bool {
    event.starts_with("exec_command")
        || event.starts_with("patch")
        || event.starts_with("apply")
        || event.starts_with("mcp_tool")
}

fn acp_content(log: &Log) -> EventContent {
    let content = &log.content;
    match log.kind.as_str() {
        "SessionStart" => EventContent {
            category: Category::Lifecycle,
            action: Action::Starting,
            phase: Phase::Started,
            summary: "session started".to_string(),
            ..Default::default()
        },
        "Message" => {
            let text = extract_text(content);
            EventContent {
                category: Category::Message,
                action: Action::Responding,
                phase: Phase::Delta,
                summary: text.clone().unwrap_or_default(),
                text,
                ..Default::default()
            }
        }
        "Thought" | "Plan" => {
            let text = extract_text(content);
            EventContent {
                category: Category::Progress,
                action: Action::Thinking,
                phase: Phase::Delta,
                summary: text.clone().unwrap_or_default(),
                text,
                ..Default::default()
            }
        }
        "ToolCall" => tool_content(content, &log.kind, Phase::Started),
        "ToolUpdate" => {
            let phase = phase_from_status(content);
            tool_content(content, &log.kind, phase)
        }
        _ => default_content(log),
    }
}

fn droid_content(log: &Log) -> EventContent {
    let content = &log.content;
    match log.kind.as_str() {
        "droid_system" => EventContent {
            category: Category::Lifecycle,
            action: Action::Starting,
            phase: Phase::Started,
            summary: "session started".to_string(),
            ..Default::default()
        },
        "droid_message" => {
            let text = extract_text(content);
            EventContent {
                category: Category::Message,
                action: Action::Responding,
                phase: Phase::Delta,
                summary: text.clone().unwrap_or_default(),
                text,
                ..Default::default()
            }
        }
        "droid_tool_call" => tool_content(content, &log.kind, Phase::Started),
        "droid_tool_result" => {
            let phase = phase_from_status(content);
            tool_content(content, &log.kind, phase)
        }
        "droid_completion" => {
            let text = extract_text(content);
            EventContent {
                category: Category::Message,
                action: Action::Responding,
                phase: Phase::Completed,
                summary: text.clone().unwrap_or_default(),
                text,
                ..Default::default()
            }
        }
        _ => default_content(log),
    }
}

/// Fallback for tags no rule recognizes.
fn default_content(log: &Log) -> EventContent {
    let text = extract_text(&log.content);
    EventContent {
        category: Category::Progress,
        action: Action::Thinking,
        phase: Phase::Started,
        summary: text.clone().unwrap_or_default(),
        text,
        raw: if log.content.is_null() {
            None
        } else {
            Some(log.content.clone())
        },
        ..Default::default()
    }
}

/// Tool-activity record: derive the action from the tool name and build a
/// `name: target` summary.
fn tool_content(content: &Value, kind: &str, phase: Phase) -> EventContent {
    let tool_name = extract_tool_name(content).unwrap_or_else(|| kind.to_ascii_lowercase());
    let action = action_for_tool(&tool_name);
    let category = if action == Action::Thinking {
        Category::Progress
    } else {
        Category::Tool
    };
    let target = extract_target(content);
    let summary = match &target {
        Some(target) => format!("{tool_name}: {target}"),
        None => tool_name.clone(),
    };
    EventContent {
        category,
        action,
        phase,
        summary,
        tool_name: Some(tool_name),
        target,
        status: content
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string),
        ..Default::default()
    }
}

/// Keyword-derived action (substring, case-insensitive).
fn action_for_tool(name: &str) -> Action {
    let name = name.to_ascii_lowercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|kw| name.contains(kw));

    // `todowrite` must win over the `write` editing keyword.
    if matches(&["think", "todowrite", "task", "plan"]) {
        Action::Thinking
    } else if matches(&["read", "ls", "cat"]) {
        Action::Reading
    } else if matches(&["grep", "glob", "search", "websearch", "fetch", "url"]) {
        Action::Searching
    } else if matches(&["edit", "write", "multiedit", "create", "applypatch", "patch"]) {
        Action::Editing
    } else {
        Action::ToolRunning
    }
}

/// Completed iff the payload says so; failed iff a failure flag is set;
/// otherwise started.
fn phase_from_status(content: &Value) -> Phase {
    let status = content
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if matches!(status, "completed" | "success" | "succeeded") {
        return Phase::Completed;
    }
    if matches!(status, "failed" | "error") {
        return Phase::Failed;
    }
    if content.get("is_error").and_then(Value::as_bool) == Some(true)
        || content.get("success").and_then(Value::as_bool) == Some(false)
    {
        return Phase::Failed;
    }
    if content.get("success").and_then(Value::as_bool) == Some(true)
        || content.get("exit_code").and_then(Value::as_i64) == Some(0)
    {
        return Phase::Completed;
    }
    Phase::Started
}

fn extract_request_id(content: &Value) -> Option<String> {
    for key in ["request_id", "tool_call_id"] {
        match content.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Fallback chain: `tool_name` → `name` → ToolCall `title`, looked up both
/// at the top level and under the nesting the adapters produce.
fn extract_tool_name(content: &Value) -> Option<String> {
    const POINTERS: [&str; 6] = [
        "/tool_name",
        "/name",
        "/request/tool_name",
        "/tool_call/title",
        "/tool_call/name",
        "/title",
    ];
    for pointer in POINTERS {
        if let Some(name) = content.pointer(pointer).and_then(Value::as_str) {
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// The object a tool acted on: well-known input fields first, then the
/// first free-form string in the nested call arguments.
fn extract_target(content: &Value) -> Option<String> {
    const POINTERS: [&str; 8] = [
        "/input/file_path",
        "/input/path",
        "/input/pattern",
        "/input/query",
        "/file_path",
        "/path",
        "/pattern",
        "/query",
    ];
    for pointer in POINTERS {
        if let Some(target) = content.pointer(pointer).and_then(Value::as_str) {
            if !target.is_empty() {
                return Some(target.to_string());
            }
        }
    }
    for key in ["input", "arguments", "args"] {
        if let Some(value) = content.get(key) {
            if let Some(target) = first_string(value, 0) {
                return Some(target);
            }
        }
    }
    None
}

fn first_string(value: &Value, depth: usize) -> Option<String> {
    if depth > 3 {
        return None;
    }
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|item| first_string(item, depth + 1)),
        Value::Object(map) => map.values().find_map(|item| first_string(item, depth + 1)),
        _ => None,
    }
}

fn extract_text(content: &Value) -> Option<String> {
    if let Some(text) = content.as_str() {
        return non_empty(text);
    }
    for pointer in ["/text", "/message", "/result", "/content", "/error/message"] {
        if let Some(text) = content.pointer(pointer).and_then(Value::as_str) {
            if let Some(text) = non_empty(text) {
                return Some(text);
            }
        }
    }
    // Claude-style message bodies: a list of content blocks.
    for pointer in ["/message/content", "/content"] {
        if let Some(blocks) = content.pointer(pointer).and_then(Value::as_array) {
            let joined = blocks
                .iter()
                .filter_map(|block| {
                    block
                        .get("text")
                        .and_then(Value::as_str)
                        .or_else(|| block.as_str())
                })
                .collect::<Vec<_>>()
                .join("");
            if let Some(text) = non_empty(&joined) {
                return Some(text);
            }
        }
    }
    None
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_summary(category: Category) -> &'static str {
    match category {
        Category::Lifecycle => "starting",
        Category::Message => "message",
        Category::Progress => "working",
        Category::Tool => "tool",
        Category::Approval => "approval required",
        Category::Error => "error",
        Category::Done => "completed",
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn claude(log: Log) -> Event {
        transform("s-1", ExecutorKind::ClaudeCode, &log)
    }

    #[test]
    fn done_log_maps_to_terminal_event() {
        let event = claude(Log::new(log_kinds::DONE, Value::Null));
        assert_eq!(event.kind, EventKind::Done);
        assert_eq!(event.content.category, Category::Done);
        assert_eq!(event.content.phase, Phase::Completed);
        assert_eq!(event.content.summary, "completed");
        assert_eq!(event.seq, 0);
    }

    #[test]
    fn claude_result_maps_to_completed_message() {
        let event = claude(Log::new(
            log_kinds::RESULT,
            json!({ "type": "result", "result": "Hello", "is_error": false }),
        ));
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.content.phase, Phase::Completed);
        assert_eq!(event.content.text.as_deref(), Some("Hello"));
        assert_eq!(event.content.source_type, "result");
    }

    #[test]
    fn stderr_maps_to_error() {
        let event = claude(Log::text(log_kinds::STDERR, "boom"));
        assert_eq!(event.kind, EventKind::Error);
        assert_eq!(event.content.action, Action::Failed);
        assert_eq!(event.content.phase, Phase::Failed);
        assert_eq!(event.content.text.as_deref(), Some("boom"));
    }

    #[test]
    fn command_log_maps_to_lifecycle_starting() {
        let event = claude(Log::new(
            log_kinds::COMMAND,
            json!({ "command": ["claude", "--print", "hi"] }),
        ));
        assert_eq!(event.kind, EventKind::Progress);
        assert_eq!(event.content.category, Category::Lifecycle);
        assert_eq!(event.content.action, Action::Starting);
        assert_eq!(event.content.summary, "launching claude --print hi");
    }

    #[test]
    fn acp_request_permission_extracts_request_id_and_title() {
        let log = Log::new(
            log_kinds::CONTROL_REQUEST,
            json!({
                "tool_call_id": "tc-1",
                "tool_call": {
                    "tool_call_id": "tc-1",
                    "kind": "Execute",
                    "title": "ls",
                    "status": "pending",
                }
            }),
        );
        let event = transform("s-1", ExecutorKind::Gemini, &log);
        assert_eq!(event.kind, EventKind::Approval);
        assert_eq!(event.content.action, Action::ApprovalRequired);
        assert_eq!(event.content.phase, Phase::Requested);
        assert_eq!(event.content.request_id.as_deref(), Some("tc-1"));
        assert_eq!(event.content.tool_name.as_deref(), Some("ls"));
        assert_eq!(event.content.summary, "approval required: ls");
    }

    #[test]
    fn qwen_control_request_reads_nested_tool_name() {
        let log = Log::new(
            log_kinds::CONTROL_REQUEST,
            json!({
                "type": "control_request",
                "request_id": "r",
                "request": {
                    "subtype": "can_use_tool",
                    "tool_name": "bash",
                    "input": { "cmd": "rm -rf /" },
                }
            }),
        );
        let event = transform("s-1", ExecutorKind::Qwen, &log);
        assert_eq!(event.content.request_id.as_deref(), Some("r"));
        assert_eq!(event.content.tool_name.as_deref(), Some("bash"));
    }

    #[test]
    fn tool_actions_follow_keywords() {
        for (name, action) in [
            ("Read", Action::Reading),
            ("cat_file", Action::Reading),
            ("Grep", Action::Searching),
            ("WebSearch", Action::Searching),
            ("fetch_url", Action::Searching),
            ("Edit", Action::Editing),
            ("MultiEdit", Action::Editing),
            ("apply_patch", Action::Editing),
            ("exec_command_begin", Action::ToolRunning),
            ("Bash", Action::ToolRunning),
            ("TodoWrite", Action::Thinking),
            ("Task", Action::Thinking),
            ("mystery", Action::ToolRunning),
        ] {
            assert_eq!(action_for_tool(name), action, "tool {name}");
        }
    }

    #[test]
    fn thinking_tools_land_in_progress_category() {
        let event = claude(Log::new(
            "tool_use",
            json!({ "name": "TodoWrite", "input": { "todos": [] } }),
        ));
        assert_eq!(event.kind, EventKind::Progress);
        assert_eq!(event.content.action, Action::Thinking);
        assert_eq!(event.content.tool_name.as_deref(), Some("TodoWrite"));
    }

    #[test]
    fn target_prefers_file_path_over_free_strings() {
        let content = json!({
            "name": "Edit",
            "input": {
                "old_string": "a",
                "file_path": "/src/main.rs",
            }
        });
        assert_eq!(extract_target(&content).as_deref(), Some("/src/main.rs"));
    }

    #[test]
    fn target_falls_back_to_first_nested_string() {
        let content = json!({
            "name": "Run",
            "arguments": { "argv": ["make", "test"] }
        });
        assert_eq!(extract_target(&content).as_deref(), Some("make"));
    }

    #[test]
    fn tool_result_with_error_flag_is_failed() {
        let event = claude(Log::new(
            "tool_result",
            json!({ "tool_use_id": "t1", "is_error": true, "name": "Bash" }),
        ));
        assert_eq!(event.content.phase, Phase::Failed);
    }

    #[test]
    fn codex_task_complete_is_terminal() {
        let log = Log::new("codex/event/task_complete", json!({}));
        let event = transform("s-2", ExecutorKind::Codex, &log);
        assert_eq!(event.kind, EventKind::Done);
    }

    #[test]
    fn codex_exec_command_events_are_tools() {
        let begin = Log::new(
            "codex/event/exec_command_begin",
            json!({ "command": ["ls"], "call_id": "c1" }),
        );
        let event = transform("s-2", ExecutorKind::Codex, &begin);
        assert_eq!(event.kind, EventKind::Tool);
        assert_eq!(event.content.action, Action::ToolRunning);
        assert_eq!(event.content.phase, Phase::Started);

        let end = Log::new(
            "codex/event/exec_command_end",
            json!({ "call_id": "c1", "exit_code": 0 }),
        );
        let event = transform("s-2", ExecutorKind::Codex, &end);
        assert_eq!(event.content.phase, Phase::Completed);
    }

    #[test]
    fn codex_mcp_startup_names_the_server() {
        let log = Log::new("codex/event/mcp_startup", json!({ "server": "docs" }));
        let event = transform("s-2", ExecutorKind::Codex, &log);
        assert_eq!(event.content.action, Action::Starting);
        assert_eq!(event.content.target.as_deref(), Some("docs"));
    }

    #[test]
    fn acp_tool_update_completion_status() {
        let log = Log::new(
            "ToolUpdate",
            json!({ "tool_call_id": "t", "title": "Write", "status": "completed" }),
        );
        let event = transform("s-3", ExecutorKind::Qwen, &log);
        assert_eq!(event.content.phase, Phase::Completed);
        assert_eq!(event.content.action, Action::Editing);
        assert_eq!(event.content.status.as_deref(), Some("completed"));
    }

    #[test]
    fn droid_completion_is_a_completed_message() {
        let log = Log::new("droid_completion", json!({ "result": "all done" }));
        let event = transform("s-4", ExecutorKind::Droid, &log);
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.content.phase, Phase::Completed);
        assert_eq!(event.content.text.as_deref(), Some("all done"));
    }

    #[test]
    fn unknown_tags_fall_back_to_progress() {
        let log = Log::new("weird_tag", json!({ "anything": 1 }));
        let event = transform("s-5", ExecutorKind::Droid, &log);
        assert_eq!(event.kind, EventKind::Progress);
        assert_eq!(event.content.action, Action::Thinking);
        assert_eq!(event.content.summary, "working");
        assert!(event.content.raw.is_some());
    }

    #[test]
    fn transform_is_deterministic() {
        let log = Log::new(
            "tool_use",
            json!({ "name": "Grep", "input": { "pattern": "fn main" } }),
        );
        let a = transform("s-6", ExecutorKind::ClaudeCode, &log);
        let b = transform("s-6", ExecutorKind::ClaudeCode, &log);
        assert_eq!(a, b);
    }

    #[test]
    fn absent_fields_stay_absent() {
        let event = claude(Log::new(log_kinds::DONE, Value::Null));
        assert!(event.content.tool_name.is_none());
        assert!(event.content.request_id.is_none());
        assert!(event.content.target.is_none());
        assert!(event.content.text.is_none());
        assert!(event.content.raw.is_none());
    }
}
