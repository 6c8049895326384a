// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Codex adapter: JSON-RPC 2.0, one message per line, against
//! `codex app-server` over piped stdio.
//!
//! Request/response pairing uses a per-id map of one-shot reply channels;
//! all outbound frames go through the child handle's write lock so lines
//! never interleave. Notifications (no id) are forwarded as logs keyed by
//! their method name. Server-initiated requests (approval round-trips) are
//! registered as pending approvals and answered via `respond_control`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use corral_protocol::ControlDecision;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapters::AdapterOptions;
use crate::adapters::AdapterShared;
use crate::adapters::Log;
use crate::adapters::PendingApproval;
use crate::adapters::command_log;
use crate::adapters::log_kinds;
use crate::error::CorralErr;
use crate::error::Result;
use crate::exec_env::build_env;
use crate::process::ChildHandle;
use crate::process::StdioMode;
use crate::process::spawn;

/// The notification that terminates a Codex turn.
const TASK_COMPLETE_METHOD: &str = "codex/event/task_complete";

/// Responses are surfaced to the pump under this tag so the engine can
/// harvest `conversationId` / `rolloutPath` for later resumption.
const RESPONSE_LOG_KIND: &str = "codex/response";

type PendingRpc = Mutex<HashMap<i64, oneshot::Sender<Result<Value>>>>;

pub struct CodexAdapter {
    options: AdapterOptions,
    shared: Arc<AdapterShared>,
    child: Mutex<Option<Arc<ChildHandle>>>,
    rpc: Mutex<Option<Arc<RpcClient>>>,
    pending: Arc<PendingRpc>,
    approvals: Arc<Mutex<HashMap<String, PendingApproval>>>,
    conversation_id: Arc<StdMutex<Option<String>>>,
}

impl CodexAdapter {
    pub(crate) fn new(options: AdapterOptions) -> Self {
        let shared = AdapterShared::new(options.log_capacity);
        Self {
            options,
            shared,
            child: Mutex::new(None),
            rpc: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            approvals: Arc::new(Mutex::new(HashMap::new())),
            conversation_id: Arc::new(StdMutex::new(None)),
        }
    }

    pub async fn start(&self, prompt: &str) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CorralErr::ExecutorClosed);
        }

        let args = vec![
            "app-server".to_string(),
            "--listen".to_string(),
            "stdio://".to_string(),
        ];
        let env = build_env(&[self.options.env.clone()]);
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

        let rpc = Arc::new(RpcClient {
            child: handle.clone(),
            pending: self.pending.clone(),
            next_id: AtomicI64::new(0),
            timeout: self.options.rpc_timeout,
        });
        *self.child.lock().await = Some(handle);
        *self.rpc.lock().await = Some(rpc.clone());

        tokio::spawn(read_loop(
            stdout,
            self.shared.clone(),
            self.pending.clone(),
            self.approvals.clone(),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(stderr, self.shared.clone()));
        }

        // The handshake blocks on replies (60 s each), so it runs off the
        // caller's path; a failure surfaces as an error log plus done.
        let shared = self.shared.clone();
        let options = self.options.clone();
        let conversation_slot = self.conversation_id.clone();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            if let Err(err) = run_handshake(&rpc, &options, &conversation_slot, &prompt).await {
                shared
                    .emit(Log::text(
                        log_kinds::ERROR,
                        format!("codex handshake failed: {err}"),
                    ))
                    .await;
                shared.emit_done().await;
            }
        });
        Ok(())
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CorralErr::ExecutorClosed);
        }
        let rpc = self
            .rpc
            .lock()
            .await
            .clone()
            .ok_or(CorralErr::ExecutorClosed)?;
        let conversation_id = self
            .conversation_id
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CorralErr::Internal("conversation is not established yet".to_string()))?;
        rpc.request("sendUserMessage", user_message_params(&conversation_id, text))
            .await?;
        Ok(())
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
        // Hold the approvals lock across the write so removal and response
        // are atomic with respect to other responders.
        let mut approvals = self.approvals.lock().await;
        let entry = approvals
            .remove(request_id)
            .ok_or_else(|| CorralErr::NotFound(format!("approval request {request_id}")))?;
        let PendingApproval::CodexRpc { rpc_id } = entry else {
            return Err(CorralErr::Internal(
                "pending entry is not a JSON-RPC approval".to_string(),
            ));
        };

        let decision_str = match decision {
            ControlDecision::Approve => "approved",
            ControlDecision::Deny => "denied",
        };
        let mut result = json!({ "decision": decision_str });
        if let Some(reason) = reason {
            result["reason"] = json!(reason);
        }
        let frame = json!({ "jsonrpc": "2.0", "id": rpc_id, "result": result });

        let child = self
            .child
            .lock()
            .await
            .clone()
            .ok_or(CorralErr::ExecutorClosed)?;
        child.write_line(&frame.to_string()).await
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
        *self.rpc.lock().await = None;
        fail_pending(&self.pending).await;
        self.approvals.lock().await.clear();
        self.shared.emit_done().await;
        self.shared.close_logs();
    }
}

struct RpcClient {
    child: Arc<ChildHandle>,
    pending: Arc<PendingRpc>,
    next_id: AtomicI64,
    timeout: Duration,
}

impl RpcClient {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(err) = self.child.write_line(&frame.to_string()).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(CorralErr::Timeout)
            }
            Ok(Err(_)) => Err(CorralErr::ClientClosed),
            Ok(Ok(reply)) => reply,
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.child.write_line(&frame.to_string()).await
    }
}

fn user_message_params(conversation_id: &str, text: &str) -> Value {
    json!({
        "conversationId": conversation_id,
        "items": [{ "type": "text", "text": text }],
    })
}

async fn run_handshake(
    rpc: &RpcClient,
    options: &AdapterOptions,
    conversation_slot: &StdMutex<Option<String>>,
    prompt: &str,
) -> Result<()> {
    rpc.request(
        "initialize",
        json!({ "protocolVersion": 1, "capabilities": {} }),
    )
    .await?;
    rpc.notify("initialized", json!({})).await?;

    let mut params = serde_json::Map::new();
    params.insert(
        "cwd".to_string(),
        json!(options.working_dir.to_string_lossy()),
    );
    if let Some(model) = &options.model {
        params.insert("model".to_string(), json!(model));
    }
    if let Some(sandbox) = &options.sandbox {
        params.insert("sandbox".to_string(), json!(sandbox));
    }
    params.insert(
        "approvalPolicy".to_string(),
        json!(if options.approvals { "on-request" } else { "never" }),
    );
    if let Some(resume_id) = &options.resume_session_id {
        params.insert("conversationId".to_string(), json!(resume_id));
    }
    if let Some(resume_path) = &options.resume_path {
        params.insert("rolloutPath".to_string(), json!(resume_path));
    }

    let conversation = rpc
        .request("newConversation", Value::Object(params))
        .await?;
    let conversation_id = conversation
        .get("conversationId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| options.resume_session_id.clone())
        .ok_or_else(|| {
            CorralErr::Internal("newConversation returned no conversationId".to_string())
        })?;
    *conversation_slot.lock().unwrap() = Some(conversation_id.clone());

    rpc.request(
        "addConversationListener",
        json!({ "conversationId": conversation_id }),
    )
    .await?;
    rpc.request(
        "sendUserMessage",
        user_message_params(&conversation_id, prompt),
    )
    .await?;
    Ok(())
}

/// Single-threaded reader: dispatch inbound frames by id/method.
async fn read_loop(
    mut stdout: mpsc::Receiver<String>,
    shared: Arc<AdapterShared>,
    pending: Arc<PendingRpc>,
    approvals: Arc<Mutex<HashMap<String, PendingApproval>>>,
) {
    while let Some(line) = stdout.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(_) => {
                shared.emit(Log::text(log_kinds::STDOUT, line)).await;
                continue;
            }
        };
        let Some(obj) = value.as_object() else {
            shared.emit(Log::text(log_kinds::STDOUT, line)).await;
            continue;
        };

        let id = obj.get("id");
        let method = obj.get("method").and_then(Value::as_str);
        match (id, method) {
            (Some(id), Some(method)) => {
                // Server-initiated request: an approval round-trip.
                let request_id = rpc_id_string(id);
                approvals.lock().await.insert(
                    request_id.clone(),
                    PendingApproval::CodexRpc { rpc_id: id.clone() },
                );
                let params = obj.get("params").cloned().unwrap_or(Value::Null);
                shared
                    .emit(Log::new(
                        log_kinds::CONTROL_REQUEST,
                        json!({
                            "request_id": request_id,
                            "method": method,
                            "request": params,
                        }),
                    ))
                    .await;
            }
            (Some(id), None) => {
                let Some(id) = id.as_i64() else {
                    debug!("response with non-numeric id: {id:?}");
                    continue;
                };
                let waiter = pending.lock().await.remove(&id);
                let reply = match obj.get("error") {
                    Some(error) => Err(CorralErr::Internal(error.to_string())),
                    None => Ok(obj.get("result").cloned().unwrap_or(Value::Null)),
                };
                if let Ok(result) = &reply {
                    if result.is_object() {
                        shared
                            .emit(Log::new(RESPONSE_LOG_KIND, result.clone()))
                            .await;
                    }
                }
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    // A response that arrives after its pending entry was
                    // removed (timeout) is ignored.
                    None => debug!("reply for unknown or expired request id {id}"),
                }
            }
            (None, Some(method)) => {
                let params = obj.get("params").cloned().unwrap_or(Value::Null);
                let terminal = method == TASK_COMPLETE_METHOD;
                shared.emit(Log::new(method, params)).await;
                if terminal {
                    shared.emit_done().await;
                }
            }
            (None, None) => {
                shared.emit(Log::text(log_kinds::STDOUT, line)).await;
            }
        }
    }
    fail_pending(&pending).await;
    shared.emit_done().await;
}

async fn forward_stderr(mut stderr: mpsc::Receiver<String>, shared: Arc<AdapterShared>) {
    while let Some(line) = stderr.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        shared.emit(Log::text(log_kinds::STDERR, line)).await;
    }
}

/// Resolve every in-flight request with a distinct `ClientClosed` error.
/// Waiters are drained under the lock but resolved outside it.
async fn fail_pending(pending: &PendingRpc) {
    let waiters: Vec<_> = {
        let mut pending = pending.lock().await;
        pending.drain().map(|(_, tx)| tx).collect()
    };
    for tx in waiters {
        let _ = tx.send(Err(CorralErr::ClientClosed));
    }
}

fn rpc_id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notification_becomes_method_tagged_log() {
        let shared = AdapterShared::new(16);
        let pending: Arc<PendingRpc> = Arc::new(Mutex::new(HashMap::new()));
        let approvals = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::channel(4);
        tx.send(
            r#"{"jsonrpc":"2.0","method":"codex/event/agent_message","params":{"message":"hi"}}"#
                .to_string(),
        )
        .await
        .unwrap();
        drop(tx);

        read_loop(rx, shared.clone(), pending, approvals).await;

        let logs = shared.logs();
        let first = logs.recv().await.unwrap();
        assert_eq!(first.kind, "codex/event/agent_message");
        assert_eq!(first.content["message"], "hi");
        assert_eq!(logs.recv().await.unwrap().kind, log_kinds::DONE);
    }

    #[tokio::test]
    async fn task_complete_emits_done_before_eof() {
        let shared = AdapterShared::new(16);
        let pending: Arc<PendingRpc> = Arc::new(Mutex::new(HashMap::new()));
        let approvals = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::channel(4);
        tx.send(r#"{"jsonrpc":"2.0","method":"codex/event/task_complete","params":{}}"#.to_string())
            .await
            .unwrap();
        drop(tx);

        read_loop(rx, shared.clone(), pending, approvals).await;

        let logs = shared.logs();
        assert_eq!(logs.recv().await.unwrap().kind, TASK_COMPLETE_METHOD);
        assert_eq!(logs.recv().await.unwrap().kind, log_kinds::DONE);
        // The latch suppresses the EOF duplicate.
        assert!(logs.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_request_registers_pending_approval() {
        let shared = AdapterShared::new(16);
        let pending: Arc<PendingRpc> = Arc::new(Mutex::new(HashMap::new()));
        let approvals: Arc<Mutex<HashMap<String, PendingApproval>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::channel(4);
        tx.send(
            r#"{"jsonrpc":"2.0","id":42,"method":"execCommandApproval","params":{"command":["rm"]}}"#
                .to_string(),
        )
        .await
        .unwrap();
        drop(tx);

        read_loop(rx, shared.clone(), pending, approvals.clone()).await;

        let logs = shared.logs();
        let first = logs.recv().await.unwrap();
        assert_eq!(first.kind, log_kinds::CONTROL_REQUEST);
        assert_eq!(first.content["request_id"], "42");
        assert!(matches!(
            approvals.lock().await.get("42"),
            Some(PendingApproval::CodexRpc { .. })
        ));
    }

    #[tokio::test]
    async fn eof_fails_inflight_requests_with_client_closed() {
        let shared = AdapterShared::new(16);
        let pending: Arc<PendingRpc> = Arc::new(Mutex::new(HashMap::new()));
        let approvals = Arc::new(Mutex::new(HashMap::new()));
        let (reply_tx, reply_rx) = oneshot::channel();
        pending.lock().await.insert(7, reply_tx);

        let (tx, rx) = mpsc::channel::<String>(1);
        drop(tx);
        read_loop(rx, shared.clone(), pending, approvals).await;

        let reply = reply_rx.await.unwrap();
        assert!(matches!(reply, Err(CorralErr::ClientClosed)));
    }
}
