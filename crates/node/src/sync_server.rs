//! Synchronous server node: answers each inbound request on the calling
//! task and never initiates a message on its own.
//!
//! Because the transport cannot push, everything the server wants to say
//! rides back as the reply to a request the client is currently holding
//! open: per-session queues carry the conversation envelopes (`RESP`,
//! server-initiated `CMD`, `END_REMOTE_SERVICE`), and per-client queues
//! buffer events until the next poll drains them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use cardlink_protocol::{Action, Message, ProtocolError};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::observer::MessageHandler;
use crate::pending::PendingRequests;
use crate::push::{EventChannel, PushStrategy};
use crate::session::SessionRegistry;
use crate::{check_reply, require_session_id, NodeError, Result};

/// Unbounded FIFO with async hand-off. One producer side (`push`) wakes the
/// single consumer parked in `pop_within`/`drain_within`.
#[derive(Default)]
struct MessageQueue {
    items: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl MessageQueue {
    fn push(&self, message: Message) {
        self.items.lock().push_back(message);
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<Message> {
        self.items.lock().drain(..).collect()
    }

    fn pop(&self) -> Option<Message> {
        self.items.lock().pop_front()
    }

    async fn pop_within(&self, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(message) = self.pop() {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.pop();
            }
        }
    }

    async fn drain_within(&self, timeout: Duration) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let items = self.drain();
            if !items.is_empty() {
                return items;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.drain();
            }
        }
    }
}

pub struct SyncServerNode {
    node_id: String,
    await_timeout: Duration,
    handler: OnceLock<Weak<dyn MessageHandler>>,
    sessions: SessionRegistry,
    pending: PendingRequests,
    session_queues: Mutex<HashMap<String, Arc<MessageQueue>>>,
    event_queues: Mutex<HashMap<(String, EventChannel), Arc<MessageQueue>>>,
}

impl std::fmt::Debug for SyncServerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServerNode")
            .field("node_id", &self.node_id)
            .field("await_timeout", &self.await_timeout)
            .finish_non_exhaustive()
    }
}

impl SyncServerNode {
    pub(crate) fn new(await_timeout: Duration) -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            await_timeout,
            handler: OnceLock::new(),
            sessions: SessionRegistry::new(),
            pending: PendingRequests::new(),
            session_queues: Mutex::new(HashMap::new()),
            event_queues: Mutex::new(HashMap::new()),
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

    // ── Inbound exchange ─────────────────────────────────────────────

    /// Computes the reply envelopes for one inbound request. The transport
    /// glue calls this once per network request and sends whatever comes
    /// back; an empty vector means "no event yet" on a poll.
    pub async fn on_request(self: &Arc<Self>, message: Message) -> Result<Vec<Message>> {
        match message.action {
            Action::PluginEvent | Action::ReaderEvent
                if PushStrategy::is_poll_body(message.body.as_deref(), message.api_level) =>
            {
                self.handle_event_poll(message).await
            }
            // An observable local reader on the client side reporting a
            // state change; no reply content.
            Action::ReaderEvent => {
                self.dispatch_to_handler(message);
                Ok(vec![])
            }
            // Plugin events only ever flow server to client.
            Action::PluginEvent => Err(ProtocolError::UnsupportedAction {
                action: message.action.as_str().to_string(),
                role: "sync server",
            }
            .into()),
            Action::StartPluginsObservation => {
                let client = require_client(&message)?;
                self.event_queue(&client, EventChannel::Plugin);
                self.dispatch_to_handler(message);
                Ok(vec![])
            }
            Action::StopPluginsObservation => {
                let client = require_client(&message)?;
                self.event_queues
                    .lock()
                    .remove(&(client, EventChannel::Plugin));
                self.dispatch_to_handler(message);
                Ok(vec![])
            }
            // The client's answer to a server-initiated request: complete
            // the waiter, then hold this exchange for the session's next
            // outbound envelope.
            Action::Resp | Action::Error => {
                let session_id = require_session_id(&message)?;
                match self.pending.complete(&session_id, message) {
                    Ok(()) => self.await_session_outbound(&session_id).await,
                    Err(unmatched) => {
                        tracing::warn!(
                            envelope = ?unmatched,
                            "reply matches no pending request"
                        );
                        Err(ProtocolError::UnsupportedAction {
                            action: unmatched.action.as_str().to_string(),
                            role: "sync server",
                        }
                        .into())
                    }
                }
            }
            Action::Cmd | Action::ExecuteRemoteService => {
                let session_id = require_session_id(&message)?;
                self.dispatch_to_handler(message);
                self.await_session_outbound(&session_id).await
            }
            Action::EndRemoteService => Err(ProtocolError::UnsupportedAction {
                action: message.action.as_str().to_string(),
                role: "sync server",
            }
            .into()),
        }
    }

    async fn handle_event_poll(&self, message: Message) -> Result<Vec<Message>> {
        let client = require_client(&message)?;
        let channel = if message.action == Action::PluginEvent {
            EventChannel::Plugin
        } else {
            EventChannel::Reader
        };
        let body = message.body.as_deref().unwrap_or("{}");
        let strategy = PushStrategy::decode_body(body, message.api_level)?;
        let queue = self.event_queue(&client, channel);
        match strategy {
            PushStrategy::Polling { .. } => Ok(queue.drain()),
            PushStrategy::LongPolling { timeout } => {
                // Hold the request no longer than our own await timeout.
                let hold = timeout.min(self.await_timeout);
                Ok(queue.drain_within(hold).await)
            }
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Server-initiated request within an open conversation. The envelope
    /// rides back on the exchange the client is holding; the client's next
    /// request in the same session delivers the answer.
    pub async fn send_request(&self, mut message: Message) -> Result<Message> {
        let session_id = require_session_id(&message)?;
        message.server_node_id = Some(self.node_id.clone());
        let rx = self
            .pending
            .register(&session_id, message.client_node_id.as_deref())?;
        self.session_queue(&session_id).push(message);
        match tokio::time::timeout(self.await_timeout, rx).await {
            Ok(Ok(reply)) => check_reply(reply),
            Ok(Err(_)) => Err(NodeError::PeerDisconnected(session_id)),
            Err(_) => {
                self.pending.cancel(&session_id);
                Err(NodeError::AwaitTimeout {
                    session_id,
                    timeout: self.await_timeout,
                })
            }
        }
    }

    /// Routes events to the per-client buffers and session-scoped envelopes
    /// (`RESP`, `END_REMOTE_SERVICE`) to the session queue.
    pub fn send_message(&self, mut message: Message) -> Result<()> {
        message.server_node_id = Some(self.node_id.clone());
        match message.action {
            Action::PluginEvent => {
                let client = require_client(&message)?;
                let queue = self
                    .event_queues
                    .lock()
                    .get(&(client.clone(), EventChannel::Plugin))
                    .cloned();
                match queue {
                    Some(queue) => {
                        queue.push(message);
                        Ok(())
                    }
                    None => Err(NodeError::NotObserving {
                        client,
                        channel: "plugin",
                    }),
                }
            }
            // Reader observation has no wire announcement; buffer on demand.
            Action::ReaderEvent => {
                let client = require_client(&message)?;
                self.event_queue(&client, EventChannel::Reader).push(message);
                Ok(())
            }
            _ => {
                let session_id = require_session_id(&message)?;
                self.session_queue(&session_id).push(message);
                Ok(())
            }
        }
    }

    // ── Queues ───────────────────────────────────────────────────────

    fn session_queue(&self, session_id: &str) -> Arc<MessageQueue> {
        Arc::clone(
            self.session_queues
                .lock()
                .entry(session_id.to_string())
                .or_default(),
        )
    }

    fn event_queue(&self, client_node_id: &str, channel: EventChannel) -> Arc<MessageQueue> {
        Arc::clone(
            self.event_queues
                .lock()
                .entry((client_node_id.to_string(), channel))
                .or_default(),
        )
    }

    async fn await_session_outbound(&self, session_id: &str) -> Result<Vec<Message>> {
        let queue = self.session_queue(session_id);
        match queue.pop_within(self.await_timeout).await {
            Some(message) => {
                if is_terminal(message.action) {
                    self.remove_session_queue(session_id);
                }
                Ok(vec![message])
            }
            None => Err(NodeError::AwaitTimeout {
                session_id: session_id.to_string(),
                timeout: self.await_timeout,
            }),
        }
    }

    fn remove_session_queue(&self, session_id: &str) {
        if let Some(queue) = self.session_queues.lock().remove(session_id) {
            let leftovers = queue.drain();
            if !leftovers.is_empty() {
                tracing::warn!(
                    session_id = %session_id,
                    dropped = leftovers.len(),
                    "discarding outbound envelopes of a finished session"
                );
            }
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
                if let Err(error) = node.send_message(reply) {
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
        self.remove_session_queue(session_id);
    }
}

fn is_terminal(action: Action) -> bool {
    matches!(
        action,
        Action::Resp | Action::Error | Action::EndRemoteService
    )
}

fn require_client(message: &Message) -> Result<String> {
    message.client_node_id.clone().ok_or_else(|| {
        ProtocolError::Malformed(format!(
            "envelope with action {} carries no clientNodeId",
            message.action
        ))
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cardlink_protocol::ErrorRecord;

    /// Echoes every `CMD` body back as a `RESP` through the node.
    struct Echo {
        node: OnceLock<Arc<SyncServerNode>>,
    }

    #[async_trait]
    impl MessageHandler for Echo {
        async fn on_message(&self, message: Message) -> std::result::Result<(), ErrorRecord> {
            if message.action == Action::Cmd {
                let node = self.node.get().expect("node bound");
                let reply = Message::new(Action::Resp)
                    .with_session_id(message.session_id.unwrap_or_default())
                    .with_client_node_id(message.client_node_id.unwrap_or_default())
                    .with_body(message.body.unwrap_or_default());
                node.send_message(reply)
                    .map_err(|e| ErrorRecord::wrap(&e))?;
            }
            Ok(())
        }
    }

    /// Always refuses.
    struct Rejecting;

    #[async_trait]
    impl MessageHandler for Rejecting {
        async fn on_message(&self, _message: Message) -> std::result::Result<(), ErrorRecord> {
            Err(ErrorRecord::new("IllegalArgumentException", "boom"))
        }
    }

    fn node_with(handler: Arc<dyn MessageHandler>, timeout: Duration) -> Arc<SyncServerNode> {
        let node = Arc::new(SyncServerNode::new(timeout));
        node.bind_handler(Arc::downgrade(&handler));
        node
    }

    #[tokio::test]
    async fn cmd_round_trip_through_the_handler() {
        let echo = Arc::new(Echo {
            node: OnceLock::new(),
        });
        let handler: Arc<dyn MessageHandler> = echo.clone();
        let node = node_with(handler, Duration::from_secs(1));
        echo.node.set(node.clone()).ok();

        let replies = node
            .on_request(
                Message::new(Action::Cmd)
                    .with_session_id("S1")
                    .with_client_node_id("client-1")
                    .with_body("PING"),
            )
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].action, Action::Resp);
        assert_eq!(replies[0].body.as_deref(), Some("PING"));
        assert!(replies[0].server_node_id.is_some());
    }

    #[tokio::test]
    async fn handler_failure_comes_back_as_an_error_envelope() {
        let handler: Arc<dyn MessageHandler> = Arc::new(Rejecting);
        let node = node_with(handler.clone(), Duration::from_secs(1));

        let replies = node
            .on_request(
                Message::new(Action::ExecuteRemoteService)
                    .with_session_id("S1")
                    .with_client_node_id("client-1")
                    .with_body("{}"),
            )
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].action, Action::Error);
        let record: ErrorRecord =
            serde_json::from_str(replies[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(record.message, "boom");
    }

    #[tokio::test]
    async fn long_poll_returns_empty_when_no_event_arrives() {
        let handler: Arc<dyn MessageHandler> = Arc::new(Rejecting);
        let node = node_with(handler.clone(), Duration::from_secs(1));

        let strategy = PushStrategy::LongPolling {
            timeout: Duration::from_millis(50),
        };
        let started = std::time::Instant::now();
        let replies = node
            .on_request(
                Message::new(Action::PluginEvent)
                    .with_session_id("S1")
                    .with_client_node_id("client-1")
                    .with_body(strategy.encode_body()),
            )
            .await
            .unwrap();
        assert!(replies.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn buffered_events_are_drained_by_the_next_poll() {
        let handler: Arc<dyn MessageHandler> = Arc::new(Rejecting);
        let node = node_with(handler.clone(), Duration::from_secs(1));

        // The client announces plugin observation, creating its buffer.
        node.on_request(
            Message::new(Action::StartPluginsObservation)
                .with_session_id("S0")
                .with_client_node_id("client-1"),
        )
        .await
        .unwrap();

        node.send_message(
            Message::new(Action::PluginEvent)
                .with_client_node_id("client-1")
                .with_body("READER_CONNECTED"),
        )
        .unwrap();

        let strategy = PushStrategy::Polling {
            interval: Duration::from_millis(50),
        };
        let replies = node
            .on_request(
                Message::new(Action::PluginEvent)
                    .with_session_id("S1")
                    .with_client_node_id("client-1")
                    .with_body(strategy.encode_body()),
            )
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body.as_deref(), Some("READER_CONNECTED"));
    }

    #[tokio::test]
    async fn events_for_a_non_observing_client_are_refused() {
        let handler: Arc<dyn MessageHandler> = Arc::new(Rejecting);
        let node = node_with(handler.clone(), Duration::from_secs(1));
        let error = node
            .send_message(
                Message::new(Action::PluginEvent)
                    .with_client_node_id("client-1")
                    .with_body("{}"),
            )
            .unwrap_err();
        assert!(matches!(error, NodeError::NotObserving { .. }));
    }

    #[tokio::test]
    async fn server_request_pairs_with_the_clients_next_request() {
        let handler: Arc<dyn MessageHandler> = Arc::new(Rejecting);
        let node = node_with(handler.clone(), Duration::from_secs(1));

        // The server-side application asks the client to run a command.
        let request_task = {
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
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The client answers with a new network request in the same
        // session, which is then held for the session's next envelope.
        let exchange_task = {
            let node = node.clone();
            tokio::spawn(async move {
                node.on_request(
                    Message::new(Action::Resp)
                        .with_session_id("S1")
                        .with_client_node_id("client-1")
                        .with_body("9000"),
                )
                .await
            })
        };

        let reply = request_task.await.unwrap().unwrap();
        assert_eq!(reply.body.as_deref(), Some("9000"));

        // The service finishes; the held exchange carries the terminal
        // envelope back to the client.
        node.send_message(
            Message::new(Action::EndRemoteService)
                .with_session_id("S1")
                .with_client_node_id("client-1")
                .with_body("{}"),
        )
        .unwrap();
        let held = exchange_task.await.unwrap().unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].action, Action::EndRemoteService);
    }

    #[tokio::test]
    async fn await_timeout_is_distinct() {
        let handler: Arc<dyn MessageHandler> = Arc::new(Rejecting);
        let node = node_with(handler.clone(), Duration::from_millis(50));
        // CMD dispatch fails in the handler, which answers with ERROR; use
        // a session nobody writes to by sending a never-answered CMD via
        // send_request instead.
        let error = node
            .send_request(
                Message::new(Action::Cmd)
                    .with_session_id("S-silent")
                    .with_client_node_id("client-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, NodeError::AwaitTimeout { .. }));
    }
}
