// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Live-event fan-out: a per-session set of bounded subscriber channels.
//!
//! Publishing copies the subscriber list under the lock and sends outside
//! it, non-blocking. A full channel drops the event for that subscriber
//! only; the subscriber recovers by re-subscribing with `after_seq` set to
//! the last sequence it saw.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use corral_protocol::Event;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) struct StreamManager {
    sessions: Mutex<HashMap<String, Vec<Subscriber>>>,
    capacity: usize,
    next_id: AtomicU64,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

impl StreamManager {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach a subscriber to `session_id`. The receiver ends when the
    /// session terminates or the subscriber is removed.
    pub(crate) fn subscribe(&self, session_id: &str) -> (u64, mpsc::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.sessions
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    /// Remove one subscriber; dropping its sender closes the channel.
    pub(crate) fn unsubscribe(&self, session_id: &str, id: u64) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(subscribers) = sessions.get_mut(session_id) {
            subscribers.retain(|sub| sub.id != id);
            if subscribers.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    /// Deliver `event` to every subscriber of its session. Slow consumers
    /// miss the event rather than blocking the publisher.
    pub(crate) fn publish(&self, event: &Event) {
        let targets: Vec<(u64, mpsc::Sender<Event>)> = {
            let sessions = self.sessions.lock().unwrap();
            match sessions.get(&event.session_id) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|sub| (sub.id, sub.tx.clone()))
                    .collect(),
                None => return,
            }
        };

        let mut gone = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(
                        session = %event.session_id,
                        seq = event.seq,
                        "subscriber {id} is full; dropping live event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(id),
            }
        }
        if !gone.is_empty() {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(subscribers) = sessions.get_mut(&event.session_id) {
                subscribers.retain(|sub| !gone.contains(&sub.id));
            }
        }
    }

    /// Close every subscriber channel for the session.
    pub(crate) fn unregister_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    /// Close all channels for all sessions.
    pub(crate) fn clear(&self) {
        self.sessions.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use corral_protocol::EventContent;
    use corral_protocol::EventKind;
    use corral_protocol::ExecutorKind;

    use super::*;

    fn event(session: &str, seq: u64) -> Event {
        Event {
            session_id: session.to_string(),
            executor: ExecutorKind::Droid,
            seq,
            timestamp: DateTime::UNIX_EPOCH,
            kind: EventKind::Progress,
            content: EventContent::default(),
        }
    }

    #[tokio::test]
    async fn events_reach_every_subscriber() {
        let manager = StreamManager::new(8);
        let (_, mut rx1) = manager.subscribe("s");
        let (_, mut rx2) = manager.subscribe("s");

        manager.publish(&event("s", 1));

        assert_eq!(rx1.recv().await.unwrap().seq, 1);
        assert_eq!(rx2.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn full_channel_drops_live_events_instead_of_blocking() {
        let manager = StreamManager::new(1);
        let (_, mut rx) = manager.subscribe("s");

        // Neither publish blocks; the second event is dropped because the
        // capacity-1 channel was never drained.
        manager.publish(&event("s", 1));
        manager.publish(&event("s", 2));

        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_session_closes_channels() {
        let manager = StreamManager::new(8);
        let (_, mut rx) = manager.subscribe("s");
        manager.unregister_session("s");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_removes_a_single_channel() {
        let manager = StreamManager::new(8);
        let (id1, mut rx1) = manager.subscribe("s");
        let (_, mut rx2) = manager.subscribe("s");

        manager.unsubscribe("s", id1);
        manager.publish(&event("s", 1));

        assert!(rx1.recv().await.is_none());
        assert_eq!(rx2.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn publish_to_unknown_session_is_a_no_op() {
        let manager = StreamManager::new(8);
        manager.publish(&event("nobody", 1));
    }
}
