//! Protocol adapters: per-agent process drivers that translate a specific
//! wire protocol into the shared [`Log`] stream and forward outbound
//! messages and approval decisions.
//!
//! The six executors resolve to four adapter families modeled as a tagged
//! sum ([`AnyAdapter`]) with one shared behavior surface — no trait objects,
//! no hierarchy. The ACP family is a single compositional adapter
//! parameterized per executor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use corral_protocol::ControlDecision;
use corral_protocol::ExecutorKind;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::CorralErr;
use crate::error::Result;

pub mod acp;
pub mod claude;
pub mod codex;
pub mod droid;

/// Adapter-local record: a short adapter-chosen tag plus an opaque payload.
/// Never persisted — it only carries adapter semantics to the transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct Log {
    pub kind: String,
    pub content: Value,
}

impl Log {
    pub fn new(kind: impl Into<String>, content: Value) -> Self {
        Self {
            kind: kind.into(),
            content,
        }
    }

    /// A log whose payload is a single `text` field.
    pub fn text(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(kind, serde_json::json!({ "text": text.into() }))
    }
}

/// Log tags with shared meaning across all adapters. Everything else is
/// adapter-specific and interpreted by that executor's transformer.
pub mod log_kinds {
    pub const DONE: &str = "done";
    pub const ERROR: &str = "error";
    pub const STDERR: &str = "stderr";
    pub const STDOUT: &str = "stdout";
    pub const COMMAND: &str = "command";
    pub const CONTROL_REQUEST: &str = "control_request";
    pub const RESULT: &str = "result";
}

/// Context needed to answer a pending approval, keyed by the
/// adapter-assigned request id. At most one entry per id; removed when the
/// response is written or the adapter closes.
#[derive(Debug, Clone)]
pub(crate) enum PendingApproval {
    /// ACP `RequestPermission`, answered with an `approval_response` line.
    Acp,
    /// Legacy Qwen `can_use_tool`; the approval echoes the original input.
    QwenCanUseTool { input: Value },
    /// Legacy Qwen `hook_callback`.
    QwenHookCallback,
    /// Server-initiated JSON-RPC request; answered with a response frame
    /// carrying this id.
    CodexRpc { rpc_id: Value },
}

/// Options an adapter is constructed with, derived from the original
/// execute request by the engine.
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub executor: ExecutorKind,

    /// Resolved agent binary (config override or the adapter default).
    pub program: String,

    pub working_dir: PathBuf,
    pub model: Option<String>,
    pub plan: bool,
    pub sandbox: Option<String>,

    /// Surface approval round-trips to the embedder.
    pub approvals: bool,

    /// Claude: pass `--dangerously-skip-permissions`.
    pub skip_permissions: bool,

    /// ACP: answer every `RequestPermission` with `allow` immediately.
    pub auto_approve: bool,

    pub env: HashMap<String, String>,

    /// Agent-assigned conversation/session id to resume.
    pub resume_session_id: Option<String>,

    /// Agent-side transcript path to resume from (Codex rollout).
    pub resume_path: Option<String>,

    pub rpc_timeout: Duration,
    pub log_capacity: usize,
}

/// State shared by every adapter family: the log queue toward the session
/// pump, the done signal, and the teardown latches.
pub(crate) struct AdapterShared {
    log_tx: async_channel::Sender<Log>,
    log_rx: async_channel::Receiver<Log>,
    done: CancellationToken,
    done_emitted: AtomicBool,
    closed: AtomicBool,
}

impl AdapterShared {
    pub(crate) fn new(log_capacity: usize) -> Arc<Self> {
        let (log_tx, log_rx) = async_channel::bounded(log_capacity.max(1));
        Arc::new(Self {
            log_tx,
            log_rx,
            done: CancellationToken::new(),
            done_emitted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) async fn emit(&self, log: Log) {
        if self.log_tx.send(log).await.is_err() {
            tracing::debug!("log channel closed; dropping adapter output");
        }
    }

    /// Emit the synthetic terminal log (once) and resolve the done signal.
    pub(crate) async fn emit_done(&self) {
        if !self.done_emitted.swap(true, Ordering::SeqCst) {
            self.emit(Log::new(log_kinds::DONE, Value::Null)).await;
        }
        self.done.cancel();
    }

    pub(crate) fn logs(&self) -> async_channel::Receiver<Log> {
        self.log_rx.clone()
    }

    pub(crate) fn done_signal(&self) -> CancellationToken {
        self.done.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flip the close latch. Returns `true` exactly once.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Stop accepting logs and wake a pump blocked on the queue.
    pub(crate) fn close_logs(&self) {
        self.log_tx.close();
    }
}

/// The adapter families, dispatched by executor kind.
pub enum AnyAdapter {
    Claude(claude::ClaudeAdapter),
    Codex(codex::CodexAdapter),
    Acp(acp::AcpAdapter),
    Droid(droid::DroidAdapter),
}

/// Construct the adapter for `options.executor`.
pub fn build_adapter(options: AdapterOptions) -> Result<AnyAdapter> {
    let adapter = match options.executor {
        ExecutorKind::ClaudeCode => AnyAdapter::Claude(claude::ClaudeAdapter::new(options)),
        ExecutorKind::Codex => AnyAdapter::Codex(codex::CodexAdapter::new(options)),
        ExecutorKind::Gemini | ExecutorKind::Qwen | ExecutorKind::Copilot => {
            AnyAdapter::Acp(acp::AcpAdapter::new(options))
        }
        ExecutorKind::Droid => AnyAdapter::Droid(droid::DroidAdapter::new(options)),
        ExecutorKind::Harness => {
            return Err(CorralErr::Validation("unknown executor".to_string()));
        }
    };
    Ok(adapter)
}

impl AnyAdapter {
    /// Launch the agent process and begin translating its output.
    pub async fn start(&self, prompt: &str) -> Result<()> {
        match self {
            AnyAdapter::Claude(a) => a.start(prompt).await,
            AnyAdapter::Codex(a) => a.start(prompt).await,
            AnyAdapter::Acp(a) => a.start(prompt).await,
            AnyAdapter::Droid(a) => a.start(prompt).await,
        }
    }

    /// Forward a follow-up user message into the running agent.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        match self {
            AnyAdapter::Claude(a) => a.send_message(text).await,
            AnyAdapter::Codex(a) => a.send_message(text).await,
            AnyAdapter::Acp(a) => a.send_message(text).await,
            AnyAdapter::Droid(a) => a.send_message(text).await,
        }
    }

    /// Answer a pending approval request. The pending entry is removed
    /// atomically with writing the response envelope.
    pub async fn respond_control(
        &self,
        request_id: &str,
        decision: ControlDecision,
        reason: Option<&str>,
    ) -> Result<()> {
        match self {
            AnyAdapter::Claude(a) => a.respond_control(request_id, decision, reason).await,
            AnyAdapter::Codex(a) => a.respond_control(request_id, decision, reason).await,
            AnyAdapter::Acp(a) => a.respond_control(request_id, decision, reason).await,
            AnyAdapter::Droid(a) => a.respond_control(request_id, decision, reason).await,
        }
    }

    /// SIGINT the agent. Kill is reserved for [`Self::close`].
    pub async fn interrupt(&self) -> Result<()> {
        match self {
            AnyAdapter::Claude(a) => a.interrupt().await,
            AnyAdapter::Codex(a) => a.interrupt().await,
            AnyAdapter::Acp(a) => a.interrupt().await,
            AnyAdapter::Droid(a) => a.interrupt().await,
        }
    }

    /// The adapter's log stream. Ends (after a terminal `done` log) when
    /// the agent exits or the adapter closes.
    pub fn logs(&self) -> async_channel::Receiver<Log> {
        match self {
            AnyAdapter::Claude(a) => a.logs(),
            AnyAdapter::Codex(a) => a.logs(),
            AnyAdapter::Acp(a) => a.logs(),
            AnyAdapter::Droid(a) => a.logs(),
        }
    }

    /// Cancelled when the output stream has ended.
    pub fn done_signal(&self) -> CancellationToken {
        match self {
            AnyAdapter::Claude(a) => a.done_signal(),
            AnyAdapter::Codex(a) => a.done_signal(),
            AnyAdapter::Acp(a) => a.done_signal(),
            AnyAdapter::Droid(a) => a.done_signal(),
        }
    }

    /// Idempotent teardown: kill the child, fail in-flight requests, close
    /// the log stream. Subsequent sends fail with `ExecutorClosed`.
    pub async fn close(&self) {
        match self {
            AnyAdapter::Claude(a) => a.close().await,
            AnyAdapter::Codex(a) => a.close().await,
            AnyAdapter::Acp(a) => a.close().await,
            AnyAdapter::Droid(a) => a.close().await,
        }
    }
}

/// The binary each executor launches when no config override is set.
pub fn default_program(kind: ExecutorKind) -> &'static str {
    match kind {
        ExecutorKind::ClaudeCode => "claude",
        ExecutorKind::Codex => "codex",
        ExecutorKind::Gemini => "gemini",
        ExecutorKind::Qwen => "qwen",
        ExecutorKind::Copilot => "copilot",
        ExecutorKind::Droid => "droid",
        ExecutorKind::Harness => "",
    }
}

/// Launch-notice payload shared by all adapters.
pub(crate) fn command_log(program: &str, args: &[String]) -> Log {
    let mut command = Vec::with_capacity(args.len() + 1);
    command.push(program.to_string());
    command.extend(args.iter().cloned());
    Log::new(log_kinds::COMMAND, serde_json::json!({ "command": command }))
}
