//! Connection identity and in-flight tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live connections so a drain knows when it is done
//!
//! # Design Decisions
//! - The count lives in a `watch` channel; waiting for idle is a wakeup, not a poll
//! - Guards decrement on drop, so a panicking connection task still releases its slot

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Relaxed ordering is enough: IDs only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Tracks live connections for graceful drain.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<usize>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }

    /// Record a new connection. The returned guard releases it on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active.send_modify(|n| *n += 1);
        ConnectionGuard {
            active: Arc::clone(&self.active),
            id: ConnectionId::next(),
        }
    }

    pub fn active_count(&self) -> usize {
        *self.active.borrow()
    }

    /// Resolve once no connection is live.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one connection slot for its lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<usize>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
        assert!(a.to_string().starts_with("conn-"));
    }

    #[test]
    fn tracker_counts_guards() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let first = tracker.track();
        let second = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(first);
        assert_eq!(tracker.active_count(), 1);
        drop(second);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_without_connections() {
        let tracker = ConnectionTracker::new();
        tokio::time::timeout(Duration::from_millis(100), tracker.wait_idle())
            .await
            .expect("idle tracker should not block");
    }

    #[tokio::test]
    async fn wait_idle_wakes_when_last_guard_drops() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
