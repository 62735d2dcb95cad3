//! Session table: the authoritative map from session id to open transport.
//!
//! Every operation takes the lock for a single synchronous map access; the
//! lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::transport::Transport;

#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Arc<dyn Transport>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Transport>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<dyn Transport>> {
        self.lock().get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Register `transport` under `session_id`.
    ///
    /// Called both from the transport's initialization callback and after the
    /// initialize request returns; whichever runs second overwrites the entry
    /// with the same transport. Returns true if the id was not yet present.
    pub fn ensure_registered(&self, session_id: &str, transport: Arc<dyn Transport>) -> bool {
        let inserted = self
            .lock()
            .insert(session_id.to_string(), transport)
            .is_none();
        if inserted {
            tracing::info!(session_id = %session_id, "session registered");
        }
        inserted
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<dyn Transport>> {
        let removed = self.lock().remove(session_id);
        if removed.is_some() {
            tracing::info!(session_id = %session_id, "session removed");
        }
        removed
    }

    /// Point-in-time copy of every entry, for iteration without holding the lock.
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn Transport>)> {
        self.lock()
            .iter()
            .map(|(id, t)| (id.clone(), Arc::clone(t)))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
