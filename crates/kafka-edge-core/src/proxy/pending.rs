//! Bounded correlation table for in-flight requests.
//!
//! Kafka responses carry only a correlation id, not the request kind, so
//! the proxy must remember which api_key/api_version to apply when a
//! response comes back. The table is owned by one connection and shared by
//! its two pumps; capacity is `max_open_requests` and reserving a slot
//! blocks when the table is full, which backpressures the request pump.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::Semaphore;

use crate::error::{ProxyError, Result};

/// What the response pump needs to interpret a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub api_key: i16,
    pub api_version: i16,
}

/// Bounded map from in-flight correlation id to request context.
pub struct PendingRequests {
    capacity: usize,
    slots: Semaphore,
    entries: Mutex<HashMap<i32, PendingRequest>>,
}

impl PendingRequests {
    /// Create a table holding at most `capacity` in-flight requests.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Semaphore::new(capacity),
            entries: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Reserve a slot for `correlation_id`, waiting while the table is
    /// full.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the correlation id is already in
    /// flight.
    pub async fn reserve(&self, correlation_id: i32, request: PendingRequest) -> Result<()> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| ProxyError::Shutdown)?;

        {
            let mut entries = self.entries.lock().expect("pending table lock poisoned");
            if entries.contains_key(&correlation_id) {
                // The permit drops here, releasing the slot.
                return Err(ProxyError::DuplicateCorrelation(correlation_id));
            }
            entries.insert(correlation_id, request);
        }

        // The slot is released by `complete`.
        permit.forget();
        Ok(())
    }

    /// Remove and return the entry for a response.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when no request with this correlation id is
    /// in flight.
    pub fn complete(&self, correlation_id: i32) -> Result<PendingRequest> {
        let entry = {
            let mut entries = self.entries.lock().expect("pending table lock poisoned");
            entries
                .remove(&correlation_id)
                .ok_or(ProxyError::UnknownCorrelation(correlation_id))?
        };
        self.slots.add_permits(1);
        Ok(entry)
    }

    /// Number of requests currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("pending table lock poisoned").len()
    }

    /// Whether no request is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
