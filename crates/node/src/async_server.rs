//! Asynchronous server node: one persistent duplex channel per connected
//! client node id. Outbound envelopes are addressed by the envelope's
//! `clientNodeId`; inbound envelopes arrive on the channel-reading task via
//! [`AsyncServerNode::on_message`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use cardlink_protocol::{Action, Message};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::endpoint::{ClientSink, EventExecutor};
use crate::observer::{EventObserver, MessageHandler};
use crate::pending::PendingRequests;
use crate::session::SessionRegistry;
use crate::{check_reply, require_session_id, NodeError, Result};

struct ConnectedClient {
    sink: ClientSink,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Summary of one connected client, for diagnostics.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_node_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub struct AsyncServerNode {
    node_id: String,
    clients: RwLock<HashMap<String, ConnectedClient>>,
    sessions: SessionRegistry,
    pending: PendingRequests,
    handler: OnceLock<Weak<dyn MessageHandler>>,
    observer: Option<Arc<dyn EventObserver>>,
    executor: Option<Arc<dyn EventExecutor>>,
}

impl AsyncServerNode {
    pub(crate) fn new(
        observer: Option<Arc<dyn EventObserver>>,
        executor: Option<Arc<dyn EventExecutor>>,
    ) -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            clients: RwLock::new(HashMap::new()),
            sessions: SessionRegistry::new(),
            pending: PendingRequests::new(),
            handler: OnceLock::new(),
            observer,
            executor,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Binds the message handler. The handler owns the node, so only a weak
    /// reference is kept here.
    pub fn bind_handler(&self, handler: Weak<dyn MessageHandler>) {
        if self.handler.set(handler).is_err() {
            tracing::error!("message handler is already bound");
        }
    }

    // ── Channel registry ─────────────────────────────────────────────

    /// Registers a client's outbound channel. Replaces any existing channel
    /// with the same client node id (reconnect).
    pub fn attach_client(&self, client_node_id: &str, sink: ClientSink) {
        tracing::info!(client_node_id = %client_node_id, "client channel attached");
        self.clients.write().insert(
            client_node_id.to_string(),
            ConnectedClient {
                sink,
                connected_at: Utc::now(),
                last_seen: Utc::now(),
            },
        );
    }

    /// Removes a client's channel and fails every request still waiting on
    /// that client.
    pub fn detach_client(&self, client_node_id: &str) {
        if self.clients.write().remove(client_node_id).is_none() {
            return;
        }
        let failed = self.pending.fail_for_peer(client_node_id);
        tracing::info!(
            client_node_id = %client_node_id,
            failed_in_flight = failed,
            "client channel detached"
        );
    }

    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .iter()
            .map(|(id, c)| ClientInfo {
                client_node_id: id.clone(),
                connected_at: c.connected_at,
                last_seen: c.last_seen,
            })
            .collect()
    }

    fn sink_for(&self, client_node_id: &str) -> Result<ClientSink> {
        self.clients
            .read()
            .get(client_node_id)
            .map(|c| c.sink.clone())
            .ok_or_else(|| NodeError::ClientNotConnected(client_node_id.to_string()))
    }

    fn touch(&self, client_node_id: &str) {
        if let Some(client) = self.clients.write().get_mut(client_node_id) {
            client.last_seen = Utc::now();
        }
    }

    // ── Request/response ─────────────────────────────────────────────

    /// Server-initiated request to the client owning the envelope's
    /// `clientNodeId`, awaited until that client's next envelope in the
    /// same session arrives. No timeout: a disconnect fails the waiter.
    pub async fn send_request(&self, mut message: Message) -> Result<Message> {
        let session_id = require_session_id(&message)?;
        let client_node_id = message.client_node_id.clone().ok_or_else(|| {
            NodeError::Protocol(cardlink_protocol::ProtocolError::Malformed(
                "server request without a clientNodeId".to_string(),
            ))
        })?;
        self.sessions.begin_request(&session_id)?;
        let result = self
            .request_inner(message, &session_id, &client_node_id)
            .await;
        self.sessions.end_request(&session_id);
        result
    }

    async fn request_inner(
        &self,
        mut message: Message,
        session_id: &str,
        client_node_id: &str,
    ) -> Result<Message> {
        message.server_node_id = Some(self.node_id.clone());
        let rx = self.pending.register(session_id, Some(client_node_id))?;
        let sink = match self.sink_for(client_node_id) {
            Ok(sink) => sink,
            Err(error) => {
                self.pending.cancel(session_id);
                return Err(error);
            }
        };
        if sink.send(message).await.is_err() {
            self.pending.cancel(session_id);
            return Err(NodeError::ClientNotConnected(client_node_id.to_string()));
        }
        match rx.await {
            Ok(reply) => check_reply(reply),
            Err(_) => Err(NodeError::PeerDisconnected(session_id.to_string())),
        }
    }

    /// Event push and `END_REMOTE_SERVICE` delivery: writes directly onto
    /// the channel owned by the envelope's `clientNodeId`.
    pub async fn send_message(&self, mut message: Message) -> Result<()> {
        let client_node_id = message.client_node_id.clone().ok_or_else(|| {
            NodeError::Protocol(cardlink_protocol::ProtocolError::Malformed(
                "server message without a clientNodeId".to_string(),
            ))
        })?;
        message.server_node_id = Some(self.node_id.clone());
        let sink = self.sink_for(&client_node_id)?;
        sink.send(message)
            .await
            .map_err(|_| NodeError::ClientNotConnected(client_node_id))
    }

    // ── Inbound dispatch ─────────────────────────────────────────────

    /// Entry point for each client channel's reading task. Events are
    /// pushed to the observer through the executor; anything else completes
    /// the waiter of its session or, failing that, goes to the handler.
    pub fn on_message(self: &Arc<Self>, message: Message) {
        if let Some(client_node_id) = &message.client_node_id {
            self.touch(client_node_id);
        }
        if message.action.is_event() {
            self.notify_observer(message);
            return;
        }
        let Some(session_id) = message.session_id.clone() else {
            tracing::warn!(envelope = ?message, "inbound envelope without a sessionId");
            return;
        };
        match self.pending.complete(&session_id, message) {
            Ok(()) => {}
            Err(unmatched) => self.dispatch_to_handler(unmatched),
        }
    }

    fn notify_observer(&self, message: Message) {
        let Some(observer) = self.observer.clone() else {
            tracing::warn!(envelope = ?message, "event received but no observer is configured");
            return;
        };
        let action = message.action;
        let body = message.body.unwrap_or_default();
        let task: Box<dyn FnOnce() + Send> = Box::new(move || match action {
            Action::PluginEvent => observer.on_plugin_event(&body),
            Action::ReaderEvent => observer.on_reader_event(&body),
            _ => {}
        });
        match &self.executor {
            Some(executor) => executor.execute(task),
            // Inline: slow observers are the caller's responsibility.
            None => task(),
        }
    }

    fn dispatch_to_handler(self: &Arc<Self>, message: Message) {
        let Some(handler) = self.handler.get().and_then(Weak::upgrade) else {
            tracing::error!(envelope = ?message, "no message handler bound");
            return;
        };
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let session_id = message.session_id.clone();
            let client_node_id = message.client_node_id.clone();
            let local_reader_name = message.local_reader_name.clone();
            let remote_reader_name = message.remote_reader_name.clone();
            if let Err(record) = handler.on_message(message).await {
                let mut reply = Message::new(Action::Error).with_body(record.to_body());
                reply.session_id = session_id;
                reply.client_node_id = client_node_id;
                reply.local_reader_name = local_reader_name;
                reply.remote_reader_name = remote_reader_name;
                if let Err(error) = node.send_message(reply).await {
                    tracing::warn!(error = %error, "failed to deliver an error reply");
                }
            }
        });
    }

    pub fn open_session(&self, session_id: &str) -> Result<()> {
        self.sessions.open(session_id)
    }

    pub fn close_session_silently(&self, session_id: &str) {
        self.sessions.close_silently(session_id);
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cardlink_protocol::ErrorRecord;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn server() -> Arc<AsyncServerNode> {
        Arc::new(AsyncServerNode::new(None, None))
    }

    #[tokio::test]
    async fn send_request_completes_when_the_client_answers() {
        let node = server();
        let (sink, mut outbound) = mpsc::channel(8);
        node.attach_client("client-1", sink);

        let waiting = {
            let node = node.clone();
            tokio::spawn(async move {
                node.send_request(
                    Message::new(Action::Cmd)
                        .with_session_id("S1")
                        .with_client_node_id("client-1")
                        .with_body("APDU"),
                )
                .await
            })
        };

        let sent = outbound.recv().await.unwrap();
        assert_eq!(sent.action, Action::Cmd);
        assert!(sent.server_node_id.is_some());

        node.on_message(
            Message::new(Action::Resp)
                .with_session_id("S1")
                .with_client_node_id("client-1")
                .with_body("9000"),
        );
        let reply = waiting.await.unwrap().unwrap();
        assert_eq!(reply.body.as_deref(), Some("9000"));
        assert_eq!(node.pending_count(), 0);
    }

    #[tokio::test]
    async fn request_to_an_unknown_client_fails_fast() {
        let node = server();
        let error = node
            .send_request(
                Message::new(Action::Cmd)
                    .with_session_id("S1")
                    .with_client_node_id("ghost"),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, NodeError::ClientNotConnected(_)));
        assert_eq!(node.pending_count(), 0);
    }

    #[tokio::test]
    async fn detach_fails_every_pending_request_of_that_client() {
        let node = server();
        let (sink, _outbound) = mpsc::channel(8);
        node.attach_client("client-1", sink);

        let waiting = {
            let node = node.clone();
            tokio::spawn(async move {
                node.send_request(
                    Message::new(Action::Cmd)
                        .with_session_id("S1")
                        .with_client_node_id("client-1"),
                )
                .await
            })
        };
        // Let the request register its waiter before detaching.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        node.detach_client("client-1");
        let error = waiting.await.unwrap().unwrap_err();
        assert!(matches!(error, NodeError::PeerDisconnected(_)));
    }

    #[tokio::test]
    async fn handler_failure_is_answered_with_an_error_envelope() {
        struct Rejecting;

        #[async_trait]
        impl MessageHandler for Rejecting {
            async fn on_message(&self, _message: Message) -> std::result::Result<(), ErrorRecord> {
                Err(ErrorRecord::new("IllegalArgumentException", "boom"))
            }
        }

        let node = server();
        let handler: Arc<dyn MessageHandler> = Arc::new(Rejecting);
        node.bind_handler(Arc::downgrade(&handler));
        let (sink, mut outbound) = mpsc::channel(8);
        node.attach_client("client-1", sink);

        node.on_message(
            Message::new(Action::ExecuteRemoteService)
                .with_session_id("S1")
                .with_client_node_id("client-1")
                .with_body("{}"),
        );

        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.action, Action::Error);
        assert_eq!(reply.session_id.as_deref(), Some("S1"));
        let record: ErrorRecord =
            serde_json::from_str(reply.body.as_deref().unwrap()).unwrap();
        assert_eq!(record.message, "boom");
    }

    #[tokio::test]
    async fn events_reach_the_observer_inline_without_an_executor() {
        #[derive(Default)]
        struct Recorder {
            reader: Mutex<Vec<String>>,
        }
        impl EventObserver for Recorder {
            fn on_plugin_event(&self, _body: &str) {}
            fn on_reader_event(&self, body: &str) {
                self.reader.lock().push(body.to_string());
            }
        }

        let observer = Arc::new(Recorder::default());
        let node = Arc::new(AsyncServerNode::new(Some(observer.clone()), None));
        node.on_message(
            Message::new(Action::ReaderEvent)
                .with_client_node_id("client-1")
                .with_body("CARD_INSERTED"),
        );
        assert_eq!(observer.reader.lock().as_slice(), ["CARD_INSERTED"]);
    }
}
