// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! The session engine: one registry of sessions, each owning an adapter,
//! a pump task that normalizes and persists adapter output, and the
//! subscription surface with the history/live barrier.
//!
//! Ordering contract: the pump is the only appender for its session, and
//! it appends before it publishes. A subscriber attaches to the live
//! fan-out first, then reads `latest_seq` as its barrier: every event at or
//! below the barrier comes from the history snapshot, everything above it
//! from the live channel, deduplicated by `seq`. No event is dropped or
//! duplicated across the handoff.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Weak;

use chrono::DateTime;
use chrono::Utc;
use corral_protocol::ControlResponse;
use corral_protocol::Event;
use corral_protocol::EventKind;
use corral_protocol::ExecuteRequest;
use corral_protocol::ExecuteResponse;
use corral_protocol::ExecutorKind;
use corral_protocol::SessionStatus;
use corral_protocol::SessionSummary;
use corral_protocol::SubscribeOptions;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::adapters::AdapterOptions;
use crate::adapters::AnyAdapter;
use crate::adapters::Log;
use crate::adapters::build_adapter;
use crate::adapters::default_program;
use crate::adapters::log_kinds;
use crate::config::Config;
use crate::error::CorralErr;
use crate::error::Result;
use crate::store::EventStore;
use crate::streams::StreamManager;
use crate::transform::transform;

/// Message used when `continue_task` is called without one.
pub const DEFAULT_CONTINUE_MESSAGE: &str = "continue";

/// Display titles are the first 36 characters of the trimmed prompt.
const TITLE_MAX_CHARS: usize = 36;

/// Optional engine callbacks. All run synchronously on the pump path, so
/// they must be cheap.
#[derive(Default)]
pub struct Hooks {
    pub on_session_start: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_event_stored: Option<Box<dyn Fn(&Event) + Send + Sync>>,
    pub on_session_end: Option<Box<dyn Fn(&str, SessionStatus) + Send + Sync>>,
    pub on_store_error: Option<Box<dyn Fn(&str, &CorralErr) + Send + Sync>>,
}

/// Agent-assigned identifiers harvested opportunistically from adapter
/// output, enabling `continue_task` after the original child exits.
#[derive(Debug, Clone, Default)]
pub struct ResumeState {
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub rollout_path: Option<String>,
}

pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    store: EventStore,
    streams: StreamManager,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    hooks: Hooks,
}

struct SessionHandle {
    id: String,
    executor: ExecutorKind,
    state: Mutex<SessionState>,
    adapter: tokio::sync::Mutex<Option<Arc<AnyAdapter>>>,
}

struct SessionState {
    status: SessionStatus,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    request: ExecuteRequest,
    resume: ResumeState,
}

impl Engine {
    /// Must be called from within a tokio runtime (the store's TTL sweeper
    /// is spawned here).
    pub fn new(config: Config) -> Self {
        Self::with_hooks(config, Hooks::default())
    }

    pub fn with_hooks(config: Config, hooks: Hooks) -> Self {
        let store_capacity = config.store_capacity;
        let cleanup_interval = config.cleanup_interval;
        let expire_after_done = config.expire_after_done;
        let subscriber_capacity = config.subscriber_capacity;

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            // When the sweeper expires a session's events, the session
            // record goes with them.
            let weak = weak.clone();
            let store = EventStore::new(
                store_capacity,
                cleanup_interval,
                expire_after_done,
                Some(Box::new(move |session_id: &str| {
                    if let Some(inner) = weak.upgrade() {
                        inner.sessions.write().unwrap().remove(session_id);
                    }
                })),
            );
            EngineInner {
                config,
                store,
                streams: StreamManager::new(subscriber_capacity),
                sessions: RwLock::new(HashMap::new()),
                hooks,
            }
        });
        Self { inner }
    }

    /// Start a new session: validate, register, launch the adapter, and
    /// spawn its pump.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        let prompt = request.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(CorralErr::Validation("prompt is required".to_string()));
        }
        if request.executor == ExecutorKind::Harness {
            return Err(CorralErr::Validation("unknown executor".to_string()));
        }

        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let handle = Arc::new(SessionHandle {
            id: session_id.clone(),
            executor: request.executor,
            state: Mutex::new(SessionState {
                status: SessionStatus::Running,
                title: title_from_prompt(&prompt),
                created_at: now,
                updated_at: now,
                request: request.clone(),
                resume: ResumeState::default(),
            }),
            adapter: tokio::sync::Mutex::new(None),
        });
        self.inner
            .sessions
            .write()
            .unwrap()
            .insert(session_id.clone(), handle.clone());

        let options = self.inner.adapter_options(&request, None);
        let started = async {
            let adapter = Arc::new(build_adapter(options)?);
            adapter.start(&prompt).await?;
            Ok::<_, CorralErr>(adapter)
        }
        .await;
        let adapter = match started {
            Ok(adapter) => adapter,
            Err(err) => {
                self.inner.sessions.write().unwrap().remove(&session_id);
                return Err(err);
            }
        };

        *handle.adapter.lock().await = Some(adapter.clone());
        if let Some(hook) = &self.inner.hooks.on_session_start {
            hook(&session_id);
        }
        info!(session = %session_id, executor = %request.executor, "session started");
        tokio::spawn(run_pump(self.inner.clone(), handle, adapter));

        Ok(ExecuteResponse {
            session_id,
            status: SessionStatus::Running,
        })
    }

    /// Forward a follow-up message, resurrecting the session from resume
    /// state if its adapter already exited.
    pub async fn continue_task(&self, session_id: &str, message: Option<&str>) -> Result<()> {
        let handle = self.inner.require_handle(session_id)?;
        let message = match message {
            Some(text) if !text.trim().is_empty() => text.to_string(),
            _ => DEFAULT_CONTINUE_MESSAGE.to_string(),
        };

        let mut adapter_slot = handle.adapter.lock().await;
        if let Some(adapter) = adapter_slot.clone() {
            drop(adapter_slot);
            adapter.send_message(&message).await?;
            handle.set_status(SessionStatus::Running);
            return Ok(());
        }

        let (request, resume) = {
            let state = handle.state.lock().unwrap();
            (state.request.clone(), state.resume.clone())
        };
        let resumable = match handle.executor {
            ExecutorKind::ClaudeCode => resume.session_id.is_some(),
            ExecutorKind::Codex => {
                resume.conversation_id.is_some() || resume.rollout_path.is_some()
            }
            _ => false,
        };
        if !resumable {
            return Err(CorralErr::ResumeUnavailable);
        }

        // Same session id: the store keeps appending with the next seq.
        let options = self.inner.adapter_options(&request, Some(&resume));
        let adapter = Arc::new(build_adapter(options)?);
        adapter.start(&message).await?;
        *adapter_slot = Some(adapter.clone());
        drop(adapter_slot);
        handle.set_status(SessionStatus::Running);
        info!(session = %session_id, "session resumed");
        tokio::spawn(run_pump(self.inner.clone(), handle, adapter));
        Ok(())
    }

    /// Interrupt the agent; the session may still emit a final `done`.
    pub async fn pause_task(&self, session_id: &str) -> Result<()> {
        let handle = self.inner.require_handle(session_id)?;
        let adapter = handle
            .adapter
            .lock()
            .await
            .clone()
            .ok_or(CorralErr::ExecutorClosed)?;
        adapter.interrupt().await?;
        handle.set_status(SessionStatus::Interrupted);
        Ok(())
    }

    /// Answer a pending approval request.
    pub async fn respond_control(
        &self,
        session_id: &str,
        response: &ControlResponse,
    ) -> Result<()> {
        if response.request_id.trim().is_empty() {
            return Err(CorralErr::Validation("request_id is required".to_string()));
        }
        let handle = self.inner.require_handle(session_id)?;
        let adapter = handle
            .adapter
            .lock()
            .await
            .clone()
            .ok_or(CorralErr::ExecutorClosed)?;
        adapter
            .respond_control(
                &response.request_id,
                response.decision,
                response.reason.as_deref(),
            )
            .await
    }

    /// Stored history for a session.
    pub fn list_events(&self, session_id: &str, after_seq: u64, limit: usize) -> Vec<Event> {
        self.inner.store.list(session_id, after_seq, None, limit)
    }

    /// Session summaries, most recently updated first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .inner
            .sessions
            .read()
            .unwrap()
            .values()
            .map(|handle| handle.summary())
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    pub fn session(&self, session_id: &str) -> Result<SessionSummary> {
        Ok(self.inner.require_handle(session_id)?.summary())
    }

    /// Subscribe to a session's events. History (when `return_all`) and
    /// live events arrive in `seq` order with no duplicates; the stream
    /// ends after the terminal event. A finished or unknown session with
    /// nothing left to emit yields one synthetic `done`.
    pub fn subscribe(&self, session_id: &str, opts: SubscribeOptions) -> EventStream {
        let (out_tx, out_rx) = mpsc::channel(self.inner.config.subscriber_capacity.max(1));
        let cancel = CancellationToken::new();
        tokio::spawn(run_subscription(
            self.inner.clone(),
            session_id.to_string(),
            opts,
            out_tx,
            cancel.clone(),
        ));
        EventStream {
            rx: out_rx,
            cancel,
        }
    }

    /// Interrupt every session, close every adapter, and close the store.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> = self
            .inner
            .sessions
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for handle in handles {
            let adapter = handle.adapter.lock().await.take();
            if let Some(adapter) = adapter {
                let _ = adapter.interrupt().await;
                adapter.close().await;
            }
        }
        self.inner.store.close();
        self.inner.streams.clear();
        info!("engine shut down");
    }
}

/// A live subscription. Dropping it cancels the feed.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
    cancel: CancellationToken,
}

impl EventStream {
    /// `None` once the session has terminated or the subscription was
    /// cancelled.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl EngineInner {
    fn handle(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    fn require_handle(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.handle(session_id)
            .ok_or_else(|| CorralErr::NotFound(format!("session {session_id}")))
    }

    fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.handle(session_id)
            .map(|handle| handle.state.lock().unwrap().status)
    }

    fn adapter_options(
        &self,
        request: &ExecuteRequest,
        resume: Option<&ResumeState>,
    ) -> AdapterOptions {
        // Plan mode keeps permissions on; otherwise approvals are surfaced
        // only when the caller asked for them.
        let approvals = request.plan
            || !matches!(
                request.ask_for_approval.as_deref(),
                None | Some("") | Some("never")
            );
        AdapterOptions {
            executor: request.executor,
            program: self
                .config
                .program_for(request.executor, default_program(request.executor)),
            working_dir: request
                .working_dir
                .clone()
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
            model: request.model.clone(),
            plan: request.plan,
            sandbox: request.sandbox.clone(),
            approvals,
            skip_permissions: !request.plan,
            auto_approve: !approvals,
            env: request.env.clone(),
            resume_session_id: resume.and_then(|r| {
                r.session_id.clone().or_else(|| r.conversation_id.clone())
            }),
            resume_path: resume.and_then(|r| r.rollout_path.clone()),
            rpc_timeout: self.config.rpc_timeout,
            log_capacity: self.config.log_capacity,
        }
    }
}

impl SessionHandle {
    fn touch(&self) {
        self.state.lock().unwrap().updated_at = Utc::now();
    }

    fn set_status(&self, status: SessionStatus) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        state.updated_at = Utc::now();
    }

    fn summary(&self) -> SessionSummary {
        let state = self.state.lock().unwrap();
        SessionSummary {
            session_id: self.id.clone(),
            executor: self.executor,
            status: state.status,
            title: state.title.clone(),
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

fn title_from_prompt(prompt: &str) -> String {
    prompt.trim().chars().take(TITLE_MAX_CHARS).collect()
}

/// Consume the adapter's log stream: capture resume state, transform,
/// append, publish, and finish the session on the terminal event.
async fn run_pump(
    inner: Arc<EngineInner>,
    handle: Arc<SessionHandle>,
    adapter: Arc<AnyAdapter>,
) {
    let logs = adapter.logs();
    let session_id = handle.id.clone();
    let executor = handle.executor;
    let mut saw_done = false;

    while let Ok(log) = logs.recv().await {
        capture_resume_state(executor, &log, &handle);
        let event = transform(&session_id, executor, &log);
        let stored = match inner.store.append(event) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(session = %session_id, "store append failed: {err}");
                if let Some(hook) = &inner.hooks.on_store_error {
                    hook(&session_id, &err);
                }
                continue;
            }
        };
        inner.streams.publish(&stored);
        handle.touch();
        if let Some(hook) = &inner.hooks.on_event_stored {
            hook(&stored);
        }
        if stored.kind == EventKind::Done {
            saw_done = true;
            break;
        }
    }

    let status = if saw_done {
        SessionStatus::Done
    } else {
        SessionStatus::Interrupted
    };
    handle.set_status(status);
    if let Some(hook) = &inner.hooks.on_session_end {
        hook(&session_id, status);
    }
    inner.streams.unregister_session(&session_id);
    *handle.adapter.lock().await = None;
    adapter.close().await;
    info!(session = %session_id, status = %status, "session finished");
}

/// Best-effort scan of adapter output for agent-assigned resume ids.
fn capture_resume_state(executor: ExecutorKind, log: &Log, handle: &SessionHandle) {
    match executor {
        ExecutorKind::ClaudeCode => {
            if let Some(id) = find_string(&log.content, "session_id", 0) {
                handle.state.lock().unwrap().resume.session_id = Some(id);
            }
        }
        ExecutorKind::Codex => {
            let conversation = find_string(&log.content, "conversationId", 0);
            let rollout = find_string(&log.content, "rolloutPath", 0);
            if conversation.is_some() || rollout.is_some() {
                let mut state = handle.state.lock().unwrap();
                if let Some(conversation) = conversation {
                    state.resume.conversation_id = Some(conversation);
                }
                if let Some(rollout) = rollout {
                    state.resume.rollout_path = Some(rollout);
                }
            }
        }
        _ => {}
    }
}

fn find_string(value: &Value, key: &str, depth: usize) -> Option<String> {
    if depth > 4 {
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(Value::String(found)) = map.get(key) {
                if !found.is_empty() {
                    return Some(found.clone());
                }
            }
            map.values()
                .find_map(|nested| find_string(nested, key, depth + 1))
        }
        Value::Array(items) => items
            .iter()
            .find_map(|nested| find_string(nested, key, depth + 1)),
        _ => None,
    }
}

/// Raw passthrough lines are only delivered to debug subscribers.
fn is_debug_event(event: &Event) -> bool {
    event.content.source_type == log_kinds::STDOUT
}

async fn run_subscription(
    inner: Arc<EngineInner>,
    session_id: String,
    opts: SubscribeOptions,
    out: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    // Live attach happens before the barrier read: anything the live
    // channel misses is at or below the barrier and comes from history.
    let (subscriber_id, mut live) = inner.streams.subscribe(&session_id);
    let barrier = inner.store.latest_seq(&session_id);
    let mut last_seq = opts.after_seq;
    let mut emitted_done = false;

    'feed: {
        if opts.return_all {
            let history = inner
                .store
                .list(&session_id, opts.after_seq, Some(barrier), opts.limit);
            for event in history {
                last_seq = event.seq;
                if !opts.include_debug && is_debug_event(&event) {
                    continue;
                }
                let terminal = event.is_terminal();
                if out.send(event).await.is_err() {
                    break 'feed;
                }
                if terminal {
                    emitted_done = true;
                    break 'feed;
                }
            }
        }

        // A session that is not running appends nothing further: close out
        // with a synthetic terminal event if none was replayed. This also
        // covers unknown and already-expired sessions.
        if inner.session_status(&session_id) != Some(SessionStatus::Running) {
            if !emitted_done {
                let done = synthesize_done(&inner, &session_id, last_seq);
                let _ = out.send(done).await;
            }
            break 'feed;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'feed,
                received = live.recv() => match received {
                    Some(event) => {
                        if event.seq <= last_seq {
                            // History already covered it.
                            continue;
                        }
                        last_seq = event.seq;
                        if !opts.include_debug && is_debug_event(&event) {
                            continue;
                        }
                        let terminal = event.is_terminal();
                        if out.send(event).await.is_err() {
                            break 'feed;
                        }
                        if terminal {
                            break 'feed;
                        }
                    }
                    None => {
                        // Session terminated. Recover anything the bounded
                        // channel dropped, then make sure the stream ends
                        // with a terminal event.
                        for event in inner.store.list(&session_id, last_seq, None, 0) {
                            last_seq = event.seq;
                            if !opts.include_debug && is_debug_event(&event) {
                                continue;
                            }
                            let terminal = event.is_terminal();
                            if out.send(event).await.is_err() {
                                break 'feed;
                            }
                            if terminal {
                                emitted_done = true;
                                break;
                            }
                        }
                        if !emitted_done {
                            let done = synthesize_done(&inner, &session_id, last_seq);
                            let _ = out.send(done).await;
                        }
                        break 'feed;
                    }
                }
            }
        }
    }

    inner.streams.unsubscribe(&session_id, subscriber_id);
    debug!(session = %session_id, "subscription closed");
}

/// A terminal event that was never stored (seq continues past the last
/// emitted one), used to close out streams for finished, interrupted, or
/// unknown sessions.
fn synthesize_done(inner: &EngineInner, session_id: &str, last_seq: u64) -> Event {
    let executor = inner
        .handle(session_id)
        .map(|handle| handle.executor)
        .unwrap_or(ExecutorKind::Harness);
    let mut event = transform(session_id, executor, &Log::new(log_kinds::DONE, Value::Null));
    event.seq = last_seq + 1;
    event.timestamp = Utc::now();
    event
}
