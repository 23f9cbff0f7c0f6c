//! Session store.
//!
//! The store owns every live session between ticks. A session enters on its
//! first (prefill) tick and leaves when its stopping criteria fire or the
//! transport evicts it; removing it releases its token history and cache.

use std::collections::HashMap;

use crate::core::session::{RequestId, Session};
use crate::error::{Error, Result};

/// Mapping from request id to live session.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<RequestId, Session>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session.
    ///
    /// # Errors
    ///
    /// Returns error if a session with the same id is still live.
    pub fn insert(&mut self, session: Session) -> Result<()> {
        let id = session.request_id().to_string();
        if self.sessions.contains_key(&id) {
            return Err(Error::DuplicateSession(id));
        }
        self.sessions.insert(id, session);
        Ok(())
    }

    /// Get a reference to a session.
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Get a mutable reference to a session.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Check whether a session is live.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove a session, returning it if it was live.
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of all live sessions, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    /// Drop every session.
    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
