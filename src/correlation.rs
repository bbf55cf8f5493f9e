use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::message::CorrelationId;

/// A call waiting for its response.
#[derive(Debug)]
pub struct PendingCall {
    pub response_key: String,
    pub created_at: DateTime<Utc>,
    pub deadline: Instant,
    completion: oneshot::Sender<Vec<u8>>,
}

/// What happened to a response handed to [`CorrelationRegistry::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The waiting call received the payload.
    Delivered,
    /// The entry existed but its caller had already gone away.
    Abandoned,
    /// No entry: unknown key, already resolved, expired or cancelled.
    Miss,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("a call with correlation key {0} is already in flight")]
pub struct AlreadyRegistered(pub String);

/// In-memory table from in-flight call identity to its completion handle.
///
/// Every operation is a single critical section: `register` inserts only if
/// absent, and `resolve`/`expire`/`cancel` remove and return, so an entry is
/// completed at most once.
///
/// Keyed by [`CorrelationId`] in the bridge. The key type is generic so a
/// registry keyed by response routing key can be built to show why that
/// scheme only allows one call per key at a time.
#[derive(Debug)]
pub struct CorrelationRegistry<K = CorrelationId> {
    pending: Mutex<HashMap<K, PendingCall>>,
}

impl<K> Default for CorrelationRegistry<K> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> CorrelationRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, PendingCall>> {
        // Entries stay valid even if a holder panicked
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a call that must be answered within `timeout`.
    pub fn register(
        &self,
        key: K,
        response_key: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Vec<u8>>, AlreadyRegistered> {
        self.register_until(key, response_key, Instant::now() + timeout)
    }

    /// Registers a call that must be answered by `deadline`.
    pub fn register_until(
        &self,
        key: K,
        response_key: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Vec<u8>>, AlreadyRegistered> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        if pending.contains_key(&key) {
            return Err(AlreadyRegistered(key.to_string()));
        }
        trace!(key = %key, response_key, "Registering pending call");
        pending.insert(
            key,
            PendingCall {
                response_key: response_key.to_string(),
                created_at: Utc::now(),
                deadline,
                completion: tx,
            },
        );
        Ok(rx)
    }

    /// Removes the entry for `key` and completes it with `payload`.
    pub fn resolve(&self, key: &K, payload: Vec<u8>) -> Resolution {
        let Some(call) = self.lock().remove(key) else {
            return Resolution::Miss;
        };
        let waited = Utc::now() - call.created_at;
        match call.completion.send(payload) {
            Ok(()) => {
                debug!(key = %key, response_key = %call.response_key, waited_ms = waited.num_milliseconds(), "Call resolved");
                Resolution::Delivered
            }
            Err(_) => Resolution::Abandoned,
        }
    }

    /// Removes an entry whose deadline passed. Returns whether it was present.
    pub fn expire(&self, key: &K) -> bool {
        let removed = self.lock().remove(key);
        if let Some(call) = &removed {
            warn!(key = %key, response_key = %call.response_key, "Pending call expired");
        }
        removed.is_some()
    }

    /// Removes an entry whose caller gave up. Returns whether it was present.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.lock().remove(key);
        if let Some(call) = &removed {
            debug!(key = %key, response_key = %call.response_key, "Pending call cancelled");
        }
        removed.is_some()
    }

    /// Drops every entry whose deadline is before `now`; their callers see
    /// the completion handle close. Returns the removed keys.
    pub fn expire_overdue(&self, now: Instant) -> Vec<K> {
        let mut pending = self.lock();
        let overdue: Vec<K> = pending
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &overdue {
            if let Some(call) = pending.remove(key) {
                warn!(key = %key, response_key = %call.response_key, "Swept overdue call");
            }
        }
        overdue
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
