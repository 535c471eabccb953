//! Session-indexed waiter table pairing in-flight requests with their
//! replies.

use std::collections::HashMap;

use cardlink_protocol::Message;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{NodeError, Result};

struct Waiter {
    /// Peer node that owes the reply, when known. Lets a server fail every
    /// waiter of a disconnecting client in one sweep.
    peer_node_id: Option<String>,
    tx: oneshot::Sender<Message>,
}

/// Map of session id to the oneshot sender of the caller parked in
/// `sendRequest`. Completion, cancellation, and peer-failure sweeps each
/// operate on independent keys.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `session_id`, enforcing at most one in-flight
    /// request per session.
    pub fn register(
        &self,
        session_id: &str,
        peer_node_id: Option<&str>,
    ) -> Result<oneshot::Receiver<Message>> {
        let mut waiters = self.waiters.lock();
        if waiters.contains_key(session_id) {
            return Err(NodeError::RequestAlreadyPending(session_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(
            session_id.to_string(),
            Waiter {
                peer_node_id: peer_node_id.map(str::to_string),
                tx,
            },
        );
        Ok(rx)
    }

    /// Delivers `reply` to the waiter of its session. Returns the envelope
    /// back when no waiter is registered so the caller can route it on.
    pub fn complete(&self, session_id: &str, reply: Message) -> std::result::Result<(), Message> {
        match self.waiters.lock().remove(session_id) {
            Some(waiter) => {
                // A send failure means the caller already gave up (timeout).
                let _ = waiter.tx.send(reply);
                Ok(())
            }
            None => Err(reply),
        }
    }

    /// Removes the waiter for `session_id`, if any. Used on timeout so a
    /// late reply for this session finds nothing to complete.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.waiters.lock().remove(session_id).is_some()
    }

    /// Drops every waiter owed a reply by `peer_node_id`; their callers
    /// observe a disconnect. Returns how many were failed.
    pub fn fail_for_peer(&self, peer_node_id: &str) -> usize {
        let mut waiters = self.waiters.lock();
        let doomed: Vec<String> = waiters
            .iter()
            .filter(|(_, w)| w.peer_node_id.as_deref() == Some(peer_node_id))
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in &doomed {
            waiters.remove(session_id);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}
