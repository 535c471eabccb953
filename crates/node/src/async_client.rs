//! Asynchronous client node: one persistent duplex channel opened at
//! construction, a session-indexed waiter table, and a per-request timeout.
//!
//! The transport glue owns the channel-reading side and forwards every
//! inbound envelope to [`AsyncClientNode::on_message`]. That task never
//! blocks on application logic: it resolves the waiter (or hands the event
//! to the observer) and returns.

use std::sync::Arc;
use std::time::Duration;

use cardlink_protocol::Message;
use uuid::Uuid;

use crate::endpoint::AsyncEndpointClient;
use crate::observer::EventObserver;
use crate::pending::PendingRequests;
use crate::session::SessionRegistry;
use crate::{check_reply, require_session_id, NodeError, Result};

pub struct AsyncClientNode {
    node_id: String,
    endpoint: Arc<dyn AsyncEndpointClient>,
    sessions: SessionRegistry,
    pending: PendingRequests,
    timeout: Duration,
    observer: Option<Arc<dyn EventObserver>>,
}

impl std::fmt::Debug for AsyncClientNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClientNode")
            .field("node_id", &self.node_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AsyncClientNode {
    pub(crate) fn new(
        endpoint: Arc<dyn AsyncEndpointClient>,
        timeout: Duration,
        observer: Option<Arc<dyn EventObserver>>,
    ) -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            endpoint,
            sessions: SessionRegistry::new(),
            pending: PendingRequests::new(),
            timeout,
            observer,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Writes the request onto the channel and parks until the envelope
    /// paired with its session id arrives, or the configured timeout
    /// elapses. Expiry cancels exactly this one transaction; other
    /// in-flight sessions are unaffected.
    pub async fn send_request(&self, message: Message) -> Result<Message> {
        let session_id = require_session_id(&message)?;
        self.sessions.begin_request(&session_id)?;
        let result = self.request_inner(message, &session_id).await;
        self.sessions.end_request(&session_id);
        result
    }

    async fn request_inner(&self, mut message: Message, session_id: &str) -> Result<Message> {
        message.client_node_id = Some(self.node_id.clone());
        let rx = self.pending.register(session_id, None)?;
        if let Err(error) = self.endpoint.send(message).await {
            self.pending.cancel(session_id);
            return Err(NodeError::Endpoint(error));
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => check_reply(reply),
            Ok(Err(_)) => Err(NodeError::PeerDisconnected(session_id.to_string())),
            Err(_) => {
                self.pending.cancel(session_id);
                Err(NodeError::Timeout {
                    session_id: session_id.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Fire-and-forget write onto the channel.
    pub async fn send_message(&self, mut message: Message) -> Result<()> {
        message.client_node_id = Some(self.node_id.clone());
        self.endpoint
            .send(message)
            .await
            .map_err(NodeError::Endpoint)
    }

    /// Entry point for the channel-reading task. Event envelopes go to the
    /// observer without touching the waiter table; anything else completes
    /// the waiter of its session. An envelope matching no waiter is a
    /// protocol violation and is logged with its content.
    pub fn on_message(&self, message: Message) {
        if message.action.is_event() {
            self.dispatch_event(message);
            return;
        }
        let Some(session_id) = message.session_id.clone() else {
            tracing::warn!(envelope = ?message, "inbound envelope without a sessionId");
            return;
        };
        if let Err(unmatched) = self.pending.complete(&session_id, message) {
            tracing::warn!(
                session_id = %session_id,
                envelope = ?unmatched,
                "inbound envelope matches no pending request"
            );
        }
    }

    fn dispatch_event(&self, message: Message) {
        let Some(observer) = &self.observer else {
            tracing::warn!(envelope = ?message, "event received but no observer is configured");
            return;
        };
        let body = message.body.as_deref().unwrap_or("");
        if message.action == cardlink_protocol::Action::PluginEvent {
            observer.on_plugin_event(body);
        } else {
            observer.on_reader_event(body);
        }
    }

    /// Tells the server this client wants plugin-level notifications.
    pub async fn start_plugin_observation(&self) -> Result<()> {
        let notice = Message::new(cardlink_protocol::Action::StartPluginsObservation)
            .with_session_id(crate::session::new_session_id());
        self.send_message(notice).await
    }

    pub async fn stop_plugin_observation(&self) {
        let notice = Message::new(cardlink_protocol::Action::StopPluginsObservation)
            .with_session_id(crate::session::new_session_id());
        if let Err(error) = self.send_message(notice).await {
            tracing::warn!(error = %error, "failed to announce plugin observation stop");
        }
    }

    pub fn open_session(&self, session_id: &str) -> Result<()> {
        self.sessions.open(session_id)
    }

    pub fn close_session_silently(&self, session_id: &str) {
        self.sessions.close_silently(session_id);
    }

    /// The node-lifetime session id, created on first use.
    pub fn open_global_session(&self) -> String {
        self.sessions.open_global()
    }

    pub fn global_session(&self) -> Option<String> {
        self.sessions.global()
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
