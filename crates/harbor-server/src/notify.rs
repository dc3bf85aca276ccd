//! Notification pub/sub with acknowledged delivery.
//!
//! Connections listen on keys. A write transaction queues notifications and,
//! at commit, dispatches them: every current listener is owed a send, and
//! every delivered push is owed an acknowledgment. The committing side
//! awaits full acknowledgment, which is what makes a commit observably wait
//! for its downstream consumers. A listener that disconnects is removed from
//! both books immediately; disconnection counts as acknowledgment.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::debug;

use harbor_proto::diag::{ListenerInfo, NotificationWaitInfo};
use harbor_types::{ConnectionId, TimeRange};

#[derive(Debug, Default)]
struct QueuedState {
    awaiting_send: HashSet<ConnectionId>,
    awaiting_ack: HashSet<ConnectionId>,
}

#[derive(Debug)]
struct QueuedInner {
    key: String,
    range: TimeRange,
    state: Mutex<QueuedState>,
    done: Notify,
}

impl QueuedInner {
    fn is_settled(&self) -> bool {
        let state = self.state.lock();
        state.awaiting_send.is_empty() && state.awaiting_ack.is_empty()
    }

    fn forget(&self, connection: ConnectionId) {
        let mut state = self.state.lock();
        state.awaiting_send.remove(&connection);
        state.awaiting_ack.remove(&connection);
        drop(state);
        self.done.notify_waiters();
    }
}

/// One queued notification, shared between the committing transaction, the
/// dispatcher, and the listener connections delivering it.
#[derive(Clone, Debug)]
pub struct QueuedNotification {
    inner: Arc<QueuedInner>,
}

impl QueuedNotification {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    #[must_use]
    pub fn range(&self) -> TimeRange {
        self.inner.range
    }

    /// Suspends until no listener is owed a send or an acknowledgment.
    pub async fn wait_acknowledged(&self) {
        loop {
            let notified = self.inner.done.notified();
            if self.inner.is_settled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Default)]
struct DispatchState {
    listeners: HashMap<String, HashSet<ConnectionId>>,
    /// Delivered-but-unacknowledged pushes, per connection and delivery id.
    pending_acks: HashMap<ConnectionId, HashMap<u64, Arc<QueuedInner>>>,
    /// Every queued notification that may still be waiting on someone.
    active: Vec<Weak<QueuedInner>>,
}

/// The notification registry. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct NotificationDispatch {
    state: Arc<Mutex<DispatchState>>,
}

impl NotificationDispatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `connection` as a listener on `key`.
    pub fn listen(&self, connection: ConnectionId, key: &str) {
        debug!(%connection, key, "listener registered");
        self.state
            .lock()
            .listeners
            .entry(key.to_string())
            .or_default()
            .insert(connection);
    }

    /// Creates a queued notification; it is sent only at commit dispatch.
    #[must_use]
    pub fn queue(&self, key: &str, range: TimeRange) -> QueuedNotification {
        let inner = Arc::new(QueuedInner {
            key: key.to_string(),
            range,
            state: Mutex::new(QueuedState::default()),
            done: Notify::new(),
        });
        let mut state = self.state.lock();
        state.active.retain(|weak| weak.strong_count() > 0);
        state.active.push(Arc::downgrade(&inner));
        QueuedNotification { inner }
    }

    /// Sends one queued notification to every current listener of its key.
    /// `deliver` enqueues the push on one connection and reports whether the
    /// connection accepted it; accepted listeners are owed a send.
    pub fn send(
        &self,
        queued: &QueuedNotification,
        mut deliver: impl FnMut(ConnectionId, QueuedNotification) -> bool,
    ) {
        let targets: Vec<ConnectionId> = {
            let state = self.state.lock();
            state
                .listeners
                .get(queued.key())
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        };
        for connection in targets {
            // Booked before delivery so a fast acknowledger cannot settle
            // the notification while later listeners are still unbooked.
            queued
                .inner
                .state
                .lock()
                .awaiting_send
                .insert(connection);
            if !deliver(connection, queued.clone()) {
                queued.inner.forget(connection);
            }
        }
    }

    /// A connection task wrote the push to its socket under `delivery_id`;
    /// the listener now owes an acknowledgment instead of a send.
    pub fn mark_delivered(
        &self,
        connection: ConnectionId,
        delivery_id: u64,
        queued: &QueuedNotification,
    ) {
        {
            let mut state = queued.inner.state.lock();
            state.awaiting_send.remove(&connection);
            state.awaiting_ack.insert(connection);
        }
        self.state
            .lock()
            .pending_acks
            .entry(connection)
            .or_default()
            .insert(delivery_id, Arc::clone(&queued.inner));
    }

    /// Clears one delivered push. Returns false for an unknown delivery id.
    pub fn acknowledge(&self, connection: ConnectionId, delivery_id: u64) -> bool {
        let inner = {
            let mut state = self.state.lock();
            let Some(by_id) = state.pending_acks.get_mut(&connection) else {
                return false;
            };
            let Some(inner) = by_id.remove(&delivery_id) else {
                return false;
            };
            if by_id.is_empty() {
                state.pending_acks.remove(&connection);
            }
            inner
        };
        {
            let mut state = inner.state.lock();
            state.awaiting_ack.remove(&connection);
        }
        inner.done.notify_waiters();
        true
    }

    /// Sends all queued notifications, then waits until every listener has
    /// acknowledged or disconnected.
    pub async fn dispatch(
        &self,
        queued: &[QueuedNotification],
        mut deliver: impl FnMut(ConnectionId, QueuedNotification) -> bool,
    ) {
        for notification in queued {
            self.send(notification, &mut deliver);
        }
        for notification in queued {
            notification.wait_acknowledged().await;
        }
    }

    /// Removes a disconnecting connection from listener registrations and
    /// from both books of every in-flight notification.
    pub fn disconnect(&self, connection: ConnectionId) {
        let stale: Vec<Arc<QueuedInner>> = {
            let mut state = self.state.lock();
            for listeners in state.listeners.values_mut() {
                listeners.remove(&connection);
            }
            state.listeners.retain(|_, listeners| !listeners.is_empty());
            state.pending_acks.remove(&connection);
            state.active.retain(|weak| weak.strong_count() > 0);
            state
                .active
                .iter()
                .filter_map(Weak::upgrade)
                .collect()
        };
        for inner in stale {
            inner.forget(connection);
        }
    }

    /// Current listener registrations, for diagnostics.
    #[must_use]
    pub fn listeners_snapshot(&self) -> Vec<ListenerInfo> {
        let state = self.state.lock();
        let mut out: Vec<ListenerInfo> = state
            .listeners
            .iter()
            .map(|(key, listeners)| {
                let mut connections: Vec<u64> = listeners.iter().map(|c| c.0).collect();
                connections.sort_unstable();
                ListenerInfo {
                    key: key.clone(),
                    connections,
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Notifications still waiting on sends or acknowledgments.
    #[must_use]
    pub fn wait_snapshot(&self) -> Vec<NotificationWaitInfo> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for inner in state.active.iter().filter_map(Weak::upgrade) {
            let queued = inner.state.lock();
            if queued.awaiting_send.is_empty() && queued.awaiting_ack.is_empty() {
                continue;
            }
            let mut awaiting_send: Vec<u64> = queued.awaiting_send.iter().map(|c| c.0).collect();
            let mut awaiting_ack: Vec<u64> = queued.awaiting_ack.iter().map(|c| c.0).collect();
            awaiting_send.sort_unstable();
            awaiting_ack.sort_unstable();
            out.push(NotificationWaitInfo {
                key: inner.key.clone(),
                start: inner.range.start,
                end: inner.range.end,
                awaiting_send,
                awaiting_ack,
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);

    #[tokio::test]
    async fn dispatch_waits_for_acknowledgment() {
        let dispatch = NotificationDispatch::new();
        dispatch.listen(A, "k");

        let queued = dispatch.queue("k", TimeRange::new(0, 100));
        let mut delivered = Vec::new();
        dispatch.send(&queued, |conn, q| {
            delivered.push((conn, q));
            true
        });
        assert_eq!(delivered.len(), 1);

        // Simulate the connection task writing the push.
        dispatch.mark_delivered(A, 7, &queued);

        let waiter = {
            let queued = queued.clone();
            tokio::spawn(async move { queued.wait_acknowledged().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "must wait for the ack");

        assert!(dispatch.acknowledge(A, 7));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_implicit_acknowledgment() {
        let dispatch = NotificationDispatch::new();
        dispatch.listen(A, "k");
        dispatch.listen(B, "k");

        let queued = dispatch.queue("k", TimeRange::new(0, 100));
        dispatch.send(&queued, |_, _| true);
        dispatch.mark_delivered(A, 1, &queued);
        // B never even got its send written; A never acknowledges.

        dispatch.disconnect(A);
        dispatch.disconnect(B);
        tokio::time::timeout(Duration::from_secs(1), queued.wait_acknowledged())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn no_listeners_settles_immediately() {
        let dispatch = NotificationDispatch::new();
        let queued = dispatch.queue("k", TimeRange::new(0, 100));
        dispatch.dispatch(&[queued], |_, _| true).await;
    }

    #[test]
    fn unknown_delivery_id_rejected() {
        let dispatch = NotificationDispatch::new();
        assert!(!dispatch.acknowledge(A, 99));
    }

    #[test]
    fn snapshots_reflect_books() {
        let dispatch = NotificationDispatch::new();
        dispatch.listen(A, "k");
        dispatch.listen(B, "k");
        assert_eq!(dispatch.listeners_snapshot()[0].connections, vec![1, 2]);

        let queued = dispatch.queue("k", TimeRange::new(0, 50));
        dispatch.send(&queued, |_, _| true);
        dispatch.mark_delivered(A, 1, &queued);

        let waits = dispatch.wait_snapshot();
        assert_eq!(waits.len(), 1);
        assert_eq!(waits[0].awaiting_send, vec![2]);
        assert_eq!(waits[0].awaiting_ack, vec![1]);
    }
}
