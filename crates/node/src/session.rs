//! Session bookkeeping shared by all node variants.
//!
//! A session id correlates a request with exactly one logical conversation.
//! Ids move through open -> closed and are never reopened; the optional
//! global session id lives under the same lock as the table itself so two
//! threads can never race to create two different global sessions.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::{NodeError, Result};

/// Generates a fresh session id.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    AwaitingResponse,
}

#[derive(Default)]
struct Inner {
    open: HashMap<String, SessionState>,
    closed: HashSet<String>,
    global: Option<String>,
}

/// Tracks which session ids are open, which are spent, and the lazily
/// created global session.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session. A closed id is never reused.
    pub fn open(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed.contains(session_id) {
            return Err(NodeError::SessionClosed(session_id.to_string()));
        }
        if inner.open.contains_key(session_id) {
            return Err(NodeError::SessionAlreadyOpen(session_id.to_string()));
        }
        inner.open.insert(session_id.to_string(), SessionState::Idle);
        Ok(())
    }

    /// Closes a session. Never fails; closing an unknown id only logs.
    pub fn close_silently(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        if inner.open.remove(session_id).is_none() {
            tracing::debug!(session_id = %session_id, "closing a session that was not open");
        }
        inner.closed.insert(session_id.to_string());
        if inner.global.as_deref() == Some(session_id) {
            inner.global = None;
        }
    }

    /// Marks the session as awaiting a response, enforcing at most one
    /// in-flight request per session id. A previously unseen id is opened
    /// implicitly (server-side conversations are opened by the peer).
    pub fn begin_request(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed.contains(session_id) {
            return Err(NodeError::SessionClosed(session_id.to_string()));
        }
        match inner.open.get_mut(session_id) {
            Some(state @ SessionState::Idle) => {
                *state = SessionState::AwaitingResponse;
                Ok(())
            }
            Some(SessionState::AwaitingResponse) => {
                Err(NodeError::RequestAlreadyPending(session_id.to_string()))
            }
            None => {
                inner
                    .open
                    .insert(session_id.to_string(), SessionState::AwaitingResponse);
                Ok(())
            }
        }
    }

    /// Returns the session to idle after the paired reply (or its failure).
    pub fn end_request(&self, session_id: &str) {
        if let Some(state) = self.inner.lock().open.get_mut(session_id) {
            *state = SessionState::Idle;
        }
    }

    /// Returns the global session id, creating and opening it on first use.
    /// The check and the creation happen under one lock acquisition.
    pub fn open_global(&self) -> String {
        let mut inner = self.inner.lock();
        if let Some(id) = &inner.global {
            return id.clone();
        }
        let id = new_session_id();
        inner.open.insert(id.clone(), SessionState::Idle);
        inner.global = Some(id.clone());
        id
    }

    /// The current global session id, if one was created.
    pub fn global(&self) -> Option<String> {
        self.inner.lock().global.clone()
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.inner.lock().open.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_ids_are_never_reused() {
        let sessions = SessionRegistry::new();
        sessions.open("S1").unwrap();
        sessions.close_silently("S1");
        assert!(matches!(
            sessions.open("S1"),
            Err(NodeError::SessionClosed(_))
        ));
        assert!(matches!(
            sessions.begin_request("S1"),
            Err(NodeError::SessionClosed(_))
        ));
    }

    #[test]
    fn at_most_one_request_in_flight_per_session() {
        let sessions = SessionRegistry::new();
        sessions.open("S1").unwrap();
        sessions.begin_request("S1").unwrap();
        assert!(matches!(
            sessions.begin_request("S1"),
            Err(NodeError::RequestAlreadyPending(_))
        ));
        sessions.end_request("S1");
        sessions.begin_request("S1").unwrap();
    }

    #[test]
    fn unknown_sessions_open_implicitly_on_first_request() {
        let sessions = SessionRegistry::new();
        sessions.begin_request("fresh").unwrap();
        assert!(sessions.is_open("fresh"));
    }

    #[test]
    fn global_session_is_created_exactly_once() {
        let sessions = SessionRegistry::new();
        let first = sessions.open_global();
        let second = sessions.open_global();
        assert_eq!(first, second);
        sessions.close_silently(&first);
        assert_eq!(sessions.global(), None);
        let third = sessions.open_global();
        assert_ne!(third, first);
    }

    #[test]
    fn close_is_silent_for_unknown_ids() {
        let sessions = SessionRegistry::new();
        sessions.close_silently("never-opened");
    }
}
