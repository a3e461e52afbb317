//! Process-wide registry of live proxied connections.
//!
//! Grouped by broker address so shutdown can report what it is tearing
//! down. Each member holds the connection's cancellation token; cancelling
//! it unblocks both pumps, whose teardown closes the sockets. `close_all`
//! cancels each member exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Registry of live connections.
#[derive(Default)]
pub struct ConnSet {
    inner: Mutex<HashMap<String, HashMap<u64, CancellationToken>>>,
    next_id: AtomicU64,
}

impl ConnSet {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; the returned id is unique for the process
    /// lifetime.
    pub fn add(&self, broker_address: &str, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("conn set lock poisoned");
        inner
            .entry(broker_address.to_string())
            .or_default()
            .insert(id, token);
        id
    }

    /// Deregister a connection. Returns false when the pair is unknown,
    /// which callers report as a non-fatal condition.
    #[must_use]
    pub fn remove(&self, broker_address: &str, id: u64) -> bool {
        let mut inner = self.inner.lock().expect("conn set lock poisoned");
        let Some(members) = inner.get_mut(broker_address) else {
            return false;
        };
        let removed = members.remove(&id).is_some();
        if members.is_empty() {
            inner.remove(broker_address);
        }
        removed
    }

    /// Number of live connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner
            .lock()
            .expect("conn set lock poisoned")
            .values()
            .map(HashMap::len)
            .sum()
    }

    /// Cancel every member exactly once and empty the registry. Returns
    /// the number of connections closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(String, HashMap<u64, CancellationToken>)> = {
            let mut inner = self.inner.lock().expect("conn set lock poisoned");
            inner.drain().collect()
        };

        let mut closed = 0;
        for (broker, members) in drained {
            debug!(broker = %broker, connections = members.len(), "closing connections");
            for token in members.into_values() {
                token.cancel();
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let set = ConnSet::new();
        let token = CancellationToken::new();

        let id = set.add("kafka-1:9092", token);
        assert_eq!(set.count(), 1);

        assert!(set.remove("kafka-1:9092", id));
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn test_remove_unknown_pair() {
        let set = ConnSet::new();
        assert!(!set.remove("kafka-1:9092", 42));

        let id = set.add("kafka-1:9092", CancellationToken::new());
        assert!(!set.remove("kafka-2:9092", id));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_close_all_cancels_each_once() {
        let set = ConnSet::new();
        let tokens: Vec<CancellationToken> =
            (0..3).map(|_| CancellationToken::new()).collect();

        set.add("kafka-1:9092", tokens[0].clone());
        set.add("kafka-1:9092", tokens[1].clone());
        set.add("kafka-2:9092", tokens[2].clone());

        assert_eq!(set.close_all(), 3);
        assert!(tokens.iter().all(|t| t.is_cancelled()));
        assert_eq!(set.count(), 0);

        // Second close finds nothing.
        assert_eq!(set.close_all(), 0);
    }

    #[test]
    fn test_ids_are_unique() {
        let set = ConnSet::new();
        let a = set.add("kafka-1:9092", CancellationToken::new());
        let b = set.add("kafka-1:9092", CancellationToken::new());
        assert_ne!(a, b);
        assert_eq!(set.count(), 2);
    }
}
