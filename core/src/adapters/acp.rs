//! ACP family adapter, shared by the Gemini, Qwen, and Copilot CLIs.
//!
//! Each output line is a JSON object with exactly one key equal to the
//! event tag; the payload is the value under that key. Approval responses
//! are written back to stdin as JSON lines. The Qwen configuration also
//! recognizes the legacy control channel: an explicit `control_request`
//! object answered with a `control_response` envelope whose payload depends
//! on the request subtype.

use std::collections::HashMap;
use std::sync::Arc;

use corral_protocol::ControlDecision;
use corral_protocol::ExecutorKind;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapters::AdapterOptions;
use crate::adapters::AdapterShared;
use crate::adapters::Log;
use crate::adapters::PendingApproval;
use crate::adapters::command_log;
use crate::adapters::log_kinds;
use crate::error::CorralErr;
use crate::error::Result;
use crate::exec_env::build_env;
use crate::exec_env::node_cli_defaults;
use crate::process::ChildHandle;
use crate::process::StdioMode;
use crate::process::spawn;

/// The complete ACP event tag set. A line whose single key is not in this
/// set is forwarded verbatim as stdout.
const ACP_TAGS: [&str; 10] = [
    "SessionStart",
    "Message",
    "Thought",
    "ToolCall",
    "ToolUpdate",
    "Plan",
    "RequestPermission",
    "Done",
    "Error",
    "User",
];

type PendingMap = Arc<Mutex<HashMap<String, PendingApproval>>>;

pub struct AcpAdapter {
    options: AdapterOptions,
    shared: Arc<AdapterShared>,
    child: Mutex<Option<Arc<ChildHandle>>>,
    pending: PendingMap,
    /// Qwen ships an older control channel alongside ACP.
    legacy_control: bool,
}

impl AcpAdapter {
    pub(crate) fn new(options: AdapterOptions) -> Self {
        let shared = AdapterShared::new(options.log_capacity);
        let legacy_control = options.executor == ExecutorKind::Qwen;
        Self {
            options,
            shared,
            child: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            legacy_control,
        }
    }

    pub async fn start(&self, prompt: &str) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CorralErr::ExecutorClosed);
        }

        let mut args = Vec::new();
        if let Some(model) = &self.options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push(prompt.to_string());

        let env = build_env(&[node_cli_defaults(), self.options.env.clone()]);
        let handle = Arc::new(
            spawn(
                &self.options.program,
                &args,
                &self.options.working_dir,
                &env,
                StdioMode::Piped,
            )
            .await?,
        );
        let stdout = handle
            .take_stdout()
            .ok_or_else(|| CorralErr::Spawn("stdout stream unavailable".to_string()))?;
        let stderr = handle.take_stderr();

        self.shared
            .emit(command_log(&self.options.program, &args))
            .await;
        *self.child.lock().await = Some(handle.clone());

        tokio::spawn(pump_output(
            stdout,
            self.shared.clone(),
            self.pending.clone(),
            handle,
            self.options.auto_approve,
            self.legacy_control,
        ));
        if let Some(mut stderr) = stderr {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                while let Some(line) = stderr.recv().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    shared.emit(Log::text(log_kinds::STDERR, line)).await;
                }
            });
        }
        Ok(())
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CorralErr::ExecutorClosed);
        }
        let child = self
            .child
            .lock()
            .await
            .clone()
            .ok_or(CorralErr::ExecutorClosed)?;
        let line = json!({ "User": { "text": text } });
        child.write_line(&line.to_string()).await
    }

    pub async fn respond_control(
        &self,
        request_id: &str,
        decision: ControlDecision,
        reason: Option<&str>,
    ) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CorralErr::ExecutorClosed);
        }
        // The entry is removed under the lock that is held across the
        // write, so a duplicate response cannot race us.
        let mut pending = self.pending.lock().await;
        let entry = pending
            .remove(request_id)
            .ok_or_else(|| CorralErr::NotFound(format!("approval request {request_id}")))?;
        let line = approval_line(request_id, &entry, decision, reason)?;

        let child = self
            .child
            .lock()
            .await
            .clone()
            .ok_or(CorralErr::ExecutorClosed)?;
        child.write_line(&line).await
    }

    pub async fn interrupt(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CorralErr::ExecutorClosed);
        }
        if let Some(child) = self.child.lock().await.as_ref() {
            child.interrupt();
        }
        Ok(())
    }

    pub fn logs(&self) -> async_channel::Receiver<Log> {
        self.shared.logs()
    }

    pub fn done_signal(&self) -> CancellationToken {
        self.shared.done_signal()
    }

    pub async fn close(&self) {
        if !self.shared.begin_close() {
            return;
        }
        if let Some(child) = self.child.lock().await.take() {
            child.kill();
        }
        self.pending.lock().await.clear();
        self.shared.emit_done().await;
        self.shared.close_logs();
    }
}

/// Build the response line for a pending approval.
fn approval_line(
    request_id: &str,
    entry: &PendingApproval,
    decision: ControlDecision,
    reason: Option<&str>,
) -> Result<String> {
    let value = match entry {
        PendingApproval::Acp => {
            let decision_str = match decision {
                ControlDecision::Approve => "allow",
                ControlDecision::Deny => "deny",
            };
            let mut value = json!({
                "type": "approval_response",
                "tool_call_id": request_id,
                "decision": decision_str,
            });
            if let Some(reason) = reason {
                value["reason"] = json!(reason);
            }
            value
        }
        PendingApproval::QwenCanUseTool { input } => {
            let response = match decision {
                ControlDecision::Approve => json!({
                    "behavior": "allow",
                    "updatedInput": input,
                }),
                ControlDecision::Deny => json!({
                    "behavior": "deny",
                    "message": reason.unwrap_or(""),
                    "interrupt": false,
                }),
            };
            control_response(request_id, response)
        }
        PendingApproval::QwenHookCallback => {
            let decision_str = match decision {
                ControlDecision::Approve => "allow",
                ControlDecision::Deny => "deny",
            };
            control_response(
                request_id,
                json!({
                    "hookSpecificOutput": {
                        "hookEventName": "PreToolUse",
                        "permissionDecision": decision_str,
                        "permissionDecisionReason": reason.unwrap_or(""),
                    }
                }),
            )
        }
        PendingApproval::CodexRpc { .. } => {
            return Err(CorralErr::Internal(
                "JSON-RPC approval entry in an ACP adapter".to_string(),
            ));
        }
    };
    Ok(value.to_string())
}

fn control_response(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        }
    })
}

async fn pump_output(
    mut stdout: mpsc::Receiver<String>,
    shared: Arc<AdapterShared>,
    pending: PendingMap,
    child: Arc<ChildHandle>,
    auto_approve: bool,
    legacy_control: bool,
) {
    while let Some(line) = stdout.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: Option<serde_json::Map<String, Value>> = serde_json::from_str::<Value>(&line)
            .ok()
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            });
        let Some(obj) = parsed else {
            shared.emit(Log::text(log_kinds::STDOUT, line)).await;
            continue;
        };

        if legacy_control
            && obj.get("type").and_then(Value::as_str) == Some("control_request")
        {
            handle_legacy_control(&obj, &shared, &pending, &child, auto_approve).await;
            continue;
        }

        let tag = match obj.iter().next() {
            Some((tag, _)) if obj.len() == 1 && ACP_TAGS.contains(&tag.as_str()) => tag.clone(),
            _ => {
                shared.emit(Log::text(log_kinds::STDOUT, line)).await;
                continue;
            }
        };
        let payload = obj.get(&tag).cloned().unwrap_or(Value::Null);

        match tag.as_str() {
            "Done" => {
                shared.emit_done().await;
            }
            "Error" => {
                shared.emit(Log::new(log_kinds::ERROR, payload)).await;
            }
            "RequestPermission" => {
                handle_request_permission(payload, &shared, &pending, &child, auto_approve).await;
            }
            _ => {
                shared.emit(Log::new(tag, payload)).await;
            }
        }
    }
    shared.emit_done().await;
}

/// `RequestPermission`: register (or auto-answer) and surface the approval.
async fn handle_request_permission(
    payload: Value,
    shared: &Arc<AdapterShared>,
    pending: &PendingMap,
    child: &Arc<ChildHandle>,
    auto_approve: bool,
) {
    let request_id = payload
        .get("tool_call_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    shared
        .emit(Log::new(log_kinds::CONTROL_REQUEST, payload))
        .await;
    if request_id.is_empty() {
        return;
    }

    if auto_approve {
        let line = json!({
            "type": "approval_response",
            "tool_call_id": request_id,
            "decision": "allow",
        });
        if let Err(err) = child.write_line(&line.to_string()).await {
            tracing::warn!("auto-approve write failed: {err}");
        }
    } else {
        pending
            .lock()
            .await
            .insert(request_id, PendingApproval::Acp);
    }
}

/// Legacy Qwen control channel: `{"type":"control_request", "request_id",
/// "request": {subtype, ...}}`.
async fn handle_legacy_control(
    obj: &serde_json::Map<String, Value>,
    shared: &Arc<AdapterShared>,
    pending: &PendingMap,
    child: &Arc<ChildHandle>,
    auto_approve: bool,
) {
    let request_id = match obj.get("request_id") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let request = obj.get("request").cloned().unwrap_or(Value::Null);
    let entry = match request.get("subtype").and_then(Value::as_str) {
        Some("can_use_tool") => Some(PendingApproval::QwenCanUseTool {
            input: request.get("input").cloned().unwrap_or(Value::Null),
        }),
        Some("hook_callback") => Some(PendingApproval::QwenHookCallback),
        _ => None,
    };

    shared
        .emit(Log::new(
            log_kinds::CONTROL_REQUEST,
            Value::Object(obj.clone()),
        ))
        .await;

    let Some(entry) = entry else {
        return;
    };
    if request_id.is_empty() {
        return;
    }
    if auto_approve {
        match approval_line(&request_id, &entry, ControlDecision::Approve, None) {
            Ok(line) => {
                if let Err(err) = child.write_line(&line).await {
                    tracing::warn!("auto-approve write failed: {err}");
                }
            }
            Err(err) => tracing::warn!("auto-approve failed: {err}"),
        }
    } else {
        pending.lock().await.insert(request_id, entry);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn acp_allow_line_matches_wire_format() {
        let line = approval_line("tc-1", &PendingApproval::Acp, ControlDecision::Approve, None)
            .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "approval_response",
                "tool_call_id": "tc-1",
                "decision": "allow",
            })
        );
    }

    #[test]
    fn acp_deny_line_carries_reason() {
        let line = approval_line(
            "tc-2",
            &PendingApproval::Acp,
            ControlDecision::Deny,
            Some("nope"),
        )
        .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["decision"], "deny");
        assert_eq!(value["reason"], "nope");
    }

    #[test]
    fn can_use_tool_deny_builds_control_response_envelope() {
        let entry = PendingApproval::QwenCanUseTool {
            input: json!({ "cmd": "rm -rf /" }),
        };
        let line = approval_line("r", &entry, ControlDecision::Deny, Some("unsafe")).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "control_response",
                "response": {
                    "subtype": "success",
                    "request_id": "r",
                    "response": {
                        "behavior": "deny",
                        "message": "unsafe",
                        "interrupt": false,
                    }
                }
            })
        );
    }

    #[test]
    fn can_use_tool_approve_echoes_original_input() {
        let entry = PendingApproval::QwenCanUseTool {
            input: json!({ "cmd": "ls" }),
        };
        let line = approval_line("r2", &entry, ControlDecision::Approve, None).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value["response"]["response"],
            json!({ "behavior": "allow", "updatedInput": { "cmd": "ls" } })
        );
    }

    #[test]
    fn hook_callback_builds_pre_tool_use_payload() {
        let line = approval_line(
            "h1",
            &PendingApproval::QwenHookCallback,
            ControlDecision::Approve,
            Some("fine"),
        )
        .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value["response"]["response"]["hookSpecificOutput"],
            json!({
                "hookEventName": "PreToolUse",
                "permissionDecision": "allow",
                "permissionDecisionReason": "fine",
            })
        );
    }
}
