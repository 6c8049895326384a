// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! In-memory event store.
//!
//! Each session owns an ordered event list behind its own lock, so append
//! throughput scales across sessions. `append` assigns the per-session
//! monotonic `seq` (gap-free, starting at 1) under that lock and returns a
//! copy carrying the assignment so callers never race on mutation.
//!
//! A background sweeper deletes sessions whose last event is `done` and
//! older than the TTL; running sessions are never deleted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use corral_protocol::Event;
use corral_protocol::EventKind;
use tracing::debug;

use crate::error::CorralErr;
use crate::error::Result;

/// Notified with the session id of every entry the sweeper deletes.
pub type ExpireHook = Box<dyn Fn(&str) + Send + Sync>;

pub struct EventStore {
    inner: Arc<StoreInner>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct StoreInner {
    sessions: RwLock<HashMap<String, Arc<SessionLog>>>,
    closed: AtomicBool,
    capacity: Option<usize>,
    expire_after_done: Duration,
    on_expire: Mutex<Option<ExpireHook>>,
}

#[derive(Default)]
struct SessionLog {
    state: Mutex<SessionEvents>,
}

struct SessionEvents {
    events: Vec<Event>,
    last_seq: u64,
    last_event_at: Instant,
    done: bool,
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            last_seq: 0,
            last_event_at: Instant::now(),
            done: false,
        }
    }
}

impl EventStore {
    /// Create the store and start its TTL sweeper. Must be called from
    /// within a tokio runtime.
    pub fn new(
        capacity: Option<usize>,
        cleanup_interval: Duration,
        expire_after_done: Duration,
        on_expire: Option<ExpireHook>,
    ) -> Self {
        let inner = Arc::new(StoreInner {
            sessions: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            capacity,
            expire_after_done,
            on_expire: Mutex::new(on_expire),
        });

        let sweeper = tokio::spawn({
            let inner = inner.clone();
            async move {
                let mut ticker = tokio::time::interval(cleanup_interval.max(Duration::from_millis(1)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    inner.sweep();
                }
            }
        });

        Self {
            inner,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Append `event`, assigning `seq` and stamping the timestamp if the
    /// transformer left it at the epoch.
    pub fn append(&self, mut event: Event) -> Result<Event> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CorralErr::StoreClosed);
        }
        let session = self.inner.session_entry(&event.session_id);
        let mut state = session.state.lock().unwrap();

        if let Some(capacity) = self.inner.capacity {
            if state.events.len() >= capacity {
                return Err(CorralErr::StoreFull);
            }
        }

        state.last_seq += 1;
        event.seq = state.last_seq;
        if event.timestamp == DateTime::UNIX_EPOCH {
            event.timestamp = Utc::now();
        }
        state.last_event_at = Instant::now();
        // Reflects the LAST event: a resumed session that appends past its
        // old terminal event becomes sweep-immune again.
        state.done = event.kind == EventKind::Done;
        state.events.push(event.clone());
        Ok(event)
    }

    /// Snapshot of events with `seq > after_seq` (and `seq <= until_seq`
    /// when given), ordered by `seq`, truncated to `limit` (0 = unlimited).
    pub fn list(
        &self,
        session_id: &str,
        after_seq: u64,
        until_seq: Option<u64>,
        limit: usize,
    ) -> Vec<Event> {
        let Some(session) = self.inner.get_session(session_id) else {
            return Vec::new();
        };
        let state = session.state.lock().unwrap();
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|event| event.seq > after_seq)
            .filter(|event| until_seq.is_none_or(|until| event.seq <= until))
            .cloned()
            .collect();
        if limit > 0 && events.len() > limit {
            events.truncate(limit);
        }
        events
    }

    /// The highest assigned `seq` for the session (0 if none), read under
    /// the same lock appends take — the subscription barrier relies on
    /// this.
    pub fn latest_seq(&self, session_id: &str) -> u64 {
        self.inner
            .get_session(session_id)
            .map(|session| session.state.lock().unwrap().last_seq)
            .unwrap_or(0)
    }

    /// Whether the session's last stored event was terminal.
    pub fn is_done(&self, session_id: &str) -> bool {
        self.inner
            .get_session(session_id)
            .map(|session| session.state.lock().unwrap().done)
            .unwrap_or(false)
    }

    /// Drop a session's event list. Used by the engine on explicit
    /// teardown; the sweeper does the same on TTL expiry.
    pub fn remove_session(&self, session_id: &str) {
        self.inner.sessions.write().unwrap().remove(session_id);
    }

    /// Stop accepting appends and cancel the sweeper. Idempotent.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl StoreInner {
    fn get_session(&self, session_id: &str) -> Option<Arc<SessionLog>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    fn session_entry(&self, session_id: &str) -> Arc<SessionLog> {
        if let Some(session) = self.get_session(session_id) {
            return session;
        }
        let mut sessions = self.sessions.write().unwrap();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionLog::default()))
            .clone()
    }

    /// Delete sessions whose terminal event is older than the TTL.
    /// Deletion is atomic per session.
    fn sweep(&self) {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .filter(|(_, session)| {
                    let state = session.state.lock().unwrap();
                    state.done && state.last_event_at.elapsed() >= self.expire_after_done
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        {
            let mut sessions = self.sessions.write().unwrap();
            for id in &expired {
                sessions.remove(id);
            }
        }
        let hook = self.on_expire.lock().unwrap();
        for id in &expired {
            debug!("expired session {id}");
            if let Some(hook) = hook.as_ref() {
                hook(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use corral_protocol::EventContent;
    use corral_protocol::ExecutorKind;
    use pretty_assertions::assert_eq;

    use super::*;

    fn event(session: &str, kind: EventKind) -> Event {
        Event {
            session_id: session.to_string(),
            executor: ExecutorKind::Droid,
            seq: 0,
            timestamp: DateTime::UNIX_EPOCH,
            kind,
            content: EventContent::default(),
        }
    }

    fn quiet_store() -> EventStore {
        EventStore::new(
            None,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            None,
        )
    }

    #[tokio::test]
    async fn seq_starts_at_one_and_is_gap_free() {
        let store = quiet_store();
        for expected in 1..=5u64 {
            let stored = store.append(event("s", EventKind::Progress)).unwrap();
            assert_eq!(stored.seq, expected);
            assert_ne!(stored.timestamp, DateTime::UNIX_EPOCH);
        }
        assert_eq!(store.latest_seq("s"), 5);
        assert_eq!(store.latest_seq("other"), 0);
    }

    #[tokio::test]
    async fn sessions_do_not_share_seq_space() {
        let store = quiet_store();
        store.append(event("a", EventKind::Progress)).unwrap();
        store.append(event("a", EventKind::Progress)).unwrap();
        let b = store.append(event("b", EventKind::Progress)).unwrap();
        assert_eq!(b.seq, 1);
    }

    #[tokio::test]
    async fn list_honors_bounds_and_limit() {
        let store = quiet_store();
        for _ in 0..6 {
            store.append(event("s", EventKind::Progress)).unwrap();
        }

        let seqs: Vec<u64> = store
            .list("s", 2, Some(5), 0)
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        let limited: Vec<u64> = store.list("s", 0, None, 2).iter().map(|e| e.seq).collect();
        assert_eq!(limited, vec![1, 2]);

        assert!(store.list("missing", 0, None, 0).is_empty());
    }

    #[tokio::test]
    async fn capacity_cap_reports_store_full() {
        let store = EventStore::new(
            Some(2),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            None,
        );
        store.append(event("s", EventKind::Progress)).unwrap();
        store.append(event("s", EventKind::Progress)).unwrap();
        assert!(matches!(
            store.append(event("s", EventKind::Progress)),
            Err(CorralErr::StoreFull)
        ));
    }

    #[tokio::test]
    async fn close_rejects_appends() {
        let store = quiet_store();
        store.close();
        assert!(matches!(
            store.append(event("s", EventKind::Progress)),
            Err(CorralErr::StoreClosed)
        ));
    }

    #[tokio::test]
    async fn ttl_expires_done_sessions_and_spares_running_ones() {
        static EXPIRED: AtomicUsize = AtomicUsize::new(0);
        let store = EventStore::new(
            None,
            Duration::from_millis(10),
            Duration::from_millis(40),
            Some(Box::new(|_| {
                EXPIRED.fetch_add(1, Ordering::SeqCst);
            })),
        );

        store.append(event("finished", EventKind::Progress)).unwrap();
        store.append(event("finished", EventKind::Done)).unwrap();
        store.append(event("running", EventKind::Progress)).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(store.latest_seq("finished"), 0, "finished session expired");
        assert_eq!(store.latest_seq("running"), 1, "running session retained");
        assert_eq!(EXPIRED.load(Ordering::SeqCst), 1);
    }
}
