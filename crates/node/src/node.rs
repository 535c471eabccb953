//! Kind-dispatch façades over the four node variants.
//!
//! A node's transport kind is fixed at construction. The façades delegate
//! the common contract and fail fast, naming the owning plugin, when asked
//! for the kind they were not built with.

use std::sync::{Arc, Weak};
use std::time::Duration;

use cardlink_protocol::Message;

use crate::async_client::AsyncClientNode;
use crate::async_server::AsyncServerNode;
use crate::endpoint::{AsyncEndpointClient, EventExecutor, SyncEndpointClient};
use crate::observer::{EventObserver, MessageHandler};
use crate::push::PushStrategy;
use crate::sync_client::SyncClientNode;
use crate::sync_server::SyncServerNode;
use crate::{NodeError, Result};

/// Default per-request timeout of the asynchronous client node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default hold duration of the synchronous server node.
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(20);

/// A client-role node, synchronous or asynchronous.
#[derive(Clone)]
pub enum ClientNode {
    Sync(Arc<SyncClientNode>),
    Async(Arc<AsyncClientNode>),
}

impl ClientNode {
    pub fn builder() -> ClientNodeBuilder {
        ClientNodeBuilder::new()
    }

    pub fn node_id(&self) -> &str {
        match self {
            ClientNode::Sync(node) => node.node_id(),
            ClientNode::Async(node) => node.node_id(),
        }
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, ClientNode::Sync(_))
    }

    /// The synchronous node, or a state error naming `plugin_name` and the
    /// expected kind.
    pub fn as_sync(&self, plugin_name: &str) -> Result<&Arc<SyncClientNode>> {
        match self {
            ClientNode::Sync(node) => Ok(node),
            ClientNode::Async(_) => Err(NodeError::WrongNodeKind {
                name: plugin_name.to_string(),
                expected: "a synchronous",
            }),
        }
    }

    pub fn as_async(&self, plugin_name: &str) -> Result<&Arc<AsyncClientNode>> {
        match self {
            ClientNode::Async(node) => Ok(node),
            ClientNode::Sync(_) => Err(NodeError::WrongNodeKind {
                name: plugin_name.to_string(),
                expected: "an asynchronous",
            }),
        }
    }

    pub async fn send_request(&self, message: Message) -> Result<Message> {
        match self {
            ClientNode::Sync(node) => node.send_request(message).await,
            ClientNode::Async(node) => node.send_request(message).await,
        }
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        match self {
            ClientNode::Sync(node) => node.send_message(message).await,
            ClientNode::Async(node) => node.send_message(message).await,
        }
    }

    pub fn open_session(&self, session_id: &str) -> Result<()> {
        match self {
            ClientNode::Sync(node) => node.open_session(session_id),
            ClientNode::Async(node) => node.open_session(session_id),
        }
    }

    pub fn close_session_silently(&self, session_id: &str) {
        match self {
            ClientNode::Sync(node) => node.close_session_silently(session_id),
            ClientNode::Async(node) => node.close_session_silently(session_id),
        }
    }

    pub fn open_global_session(&self) -> String {
        match self {
            ClientNode::Sync(node) => node.open_global_session(),
            ClientNode::Async(node) => node.open_global_session(),
        }
    }

    pub fn global_session(&self) -> Option<String> {
        match self {
            ClientNode::Sync(node) => node.global_session(),
            ClientNode::Async(node) => node.global_session(),
        }
    }

    pub async fn start_plugin_observation(&self) -> Result<()> {
        match self {
            ClientNode::Sync(node) => node.start_plugin_observation().await,
            ClientNode::Async(node) => node.start_plugin_observation().await,
        }
    }

    pub async fn stop_plugin_observation(&self) {
        match self {
            ClientNode::Sync(node) => node.stop_plugin_observation().await,
            ClientNode::Async(node) => node.stop_plugin_observation().await,
        }
    }

    /// Reader events are pushed natively on the asynchronous transport, so
    /// only the synchronous node has a loop to start.
    pub async fn start_reader_observation(&self) -> Result<()> {
        match self {
            ClientNode::Sync(node) => node.start_reader_observation().await,
            ClientNode::Async(_) => Ok(()),
        }
    }

    pub async fn stop_reader_observation(&self) {
        if let ClientNode::Sync(node) = self {
            node.stop_reader_observation().await;
        }
    }
}

/// A server-role node, synchronous or asynchronous.
#[derive(Clone)]
pub enum ServerNode {
    Sync(Arc<SyncServerNode>),
    Async(Arc<AsyncServerNode>),
}

impl ServerNode {
    pub fn builder() -> ServerNodeBuilder {
        ServerNodeBuilder::new()
    }

    pub fn node_id(&self) -> &str {
        match self {
            ServerNode::Sync(node) => node.node_id(),
            ServerNode::Async(node) => node.node_id(),
        }
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, ServerNode::Sync(_))
    }

    pub fn as_sync(&self, plugin_name: &str) -> Result<&Arc<SyncServerNode>> {
        match self {
            ServerNode::Sync(node) => Ok(node),
            ServerNode::Async(_) => Err(NodeError::WrongNodeKind {
                name: plugin_name.to_string(),
                expected: "a synchronous",
            }),
        }
    }

    pub fn as_async(&self, plugin_name: &str) -> Result<&Arc<AsyncServerNode>> {
        match self {
            ServerNode::Async(node) => Ok(node),
            ServerNode::Sync(_) => Err(NodeError::WrongNodeKind {
                name: plugin_name.to_string(),
                expected: "an asynchronous",
            }),
        }
    }

    pub fn bind_handler(&self, handler: Weak<dyn MessageHandler>) {
        match self {
            ServerNode::Sync(node) => node.bind_handler(handler),
            ServerNode::Async(node) => node.bind_handler(handler),
        }
    }

    pub async fn send_request(&self, message: Message) -> Result<Message> {
        match self {
            ServerNode::Sync(node) => node.send_request(message).await,
            ServerNode::Async(node) => node.send_request(message).await,
        }
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        match self {
            ServerNode::Sync(node) => node.send_message(message),
            ServerNode::Async(node) => node.send_message(message).await,
        }
    }

    pub fn open_session(&self, session_id: &str) -> Result<()> {
        match self {
            ServerNode::Sync(node) => node.open_session(session_id),
            ServerNode::Async(node) => node.open_session(session_id),
        }
    }

    pub fn close_session_silently(&self, session_id: &str) {
        match self {
            ServerNode::Sync(node) => node.close_session_silently(session_id),
            ServerNode::Async(node) => node.close_session_silently(session_id),
        }
    }
}

/// Builder for [`ClientNode`]. Exactly one endpoint kind must be supplied.
pub struct ClientNodeBuilder {
    sync_endpoint: Option<Arc<dyn SyncEndpointClient>>,
    async_endpoint: Option<Arc<dyn AsyncEndpointClient>>,
    request_timeout: Duration,
    plugin_strategy: Option<PushStrategy>,
    reader_strategy: Option<PushStrategy>,
    observer: Option<Arc<dyn EventObserver>>,
}

impl ClientNodeBuilder {
    pub fn new() -> Self {
        Self {
            sync_endpoint: None,
            async_endpoint: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            plugin_strategy: None,
            reader_strategy: None,
            observer: None,
        }
    }

    /// Use a stateless request/response transport.
    pub fn sync_endpoint(mut self, endpoint: Arc<dyn SyncEndpointClient>) -> Self {
        self.sync_endpoint = Some(endpoint);
        self
    }

    /// Use a persistent duplex transport.
    pub fn async_endpoint(mut self, endpoint: Arc<dyn AsyncEndpointClient>) -> Self {
        self.async_endpoint = Some(endpoint);
        self
    }

    /// Reply timeout of the asynchronous client (default 10s). Ignored by
    /// the synchronous client, which blocks as long as its transport does.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable plugin-level observation over a synchronous transport.
    pub fn plugin_observation(mut self, strategy: PushStrategy) -> Self {
        self.plugin_strategy = Some(strategy);
        self
    }

    /// Enable reader-level observation over a synchronous transport.
    pub fn reader_observation(mut self, strategy: PushStrategy) -> Self {
        self.reader_strategy = Some(strategy);
        self
    }

    /// Receiver of server-originated events.
    pub fn observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<ClientNode> {
        match (self.sync_endpoint, self.async_endpoint) {
            (Some(_), Some(_)) => Err(NodeError::Config(
                "exactly one of sync_endpoint and async_endpoint must be set".to_string(),
            )),
            (None, None) => Err(NodeError::Config(
                "a transport endpoint is required".to_string(),
            )),
            (Some(endpoint), None) => Ok(ClientNode::Sync(Arc::new(SyncClientNode::new(
                endpoint,
                self.observer,
                self.plugin_strategy,
                self.reader_strategy,
            )))),
            (None, Some(endpoint)) => Ok(ClientNode::Async(Arc::new(AsyncClientNode::new(
                endpoint,
                self.request_timeout,
                self.observer,
            )))),
        }
    }
}

impl Default for ClientNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ServerKind {
    Sync,
    Async,
}

/// Builder for [`ServerNode`]. Bind the message handler after building.
pub struct ServerNodeBuilder {
    kind: Option<ServerKind>,
    await_timeout: Duration,
    observer: Option<Arc<dyn EventObserver>>,
    executor: Option<Arc<dyn EventExecutor>>,
}

impl ServerNodeBuilder {
    pub fn new() -> Self {
        Self {
            kind: None,
            await_timeout: DEFAULT_AWAIT_TIMEOUT,
            observer: None,
            executor: None,
        }
    }

    /// Serve a stateless request/response transport; inbound requests are
    /// delivered to [`SyncServerNode::on_request`].
    pub fn sync_transport(mut self) -> Self {
        self.kind = Some(ServerKind::Sync);
        self
    }

    /// Serve persistent duplex channels; the transport glue attaches one
    /// sink per connected client.
    pub fn async_transport(mut self) -> Self {
        self.kind = Some(ServerKind::Async);
        self
    }

    /// How long the synchronous server holds an exchange waiting for the
    /// session's next envelope or a buffered event (default 20s).
    pub fn await_timeout(mut self, timeout: Duration) -> Self {
        self.await_timeout = timeout;
        self
    }

    /// Receiver of client-originated events (asynchronous transport).
    pub fn observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Executor decoupling observer notification from the channel task.
    pub fn executor(mut self, executor: Arc<dyn EventExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<ServerNode> {
        match self.kind {
            Some(ServerKind::Sync) => Ok(ServerNode::Sync(Arc::new(SyncServerNode::new(
                self.await_timeout,
            )))),
            Some(ServerKind::Async) => Ok(ServerNode::Async(Arc::new(AsyncServerNode::new(
                self.observer,
                self.executor,
            )))),
            None => Err(NodeError::Config(
                "a transport kind is required".to_string(),
            )),
        }
    }
}

impl Default for ServerNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullEndpoint;

    #[async_trait]
    impl SyncEndpointClient for NullEndpoint {
        async fn transmit(&self, _message: Message) -> anyhow::Result<Vec<Message>> {
            Ok(vec![])
        }
    }

    #[test]
    fn wrong_kind_accessors_fail_fast() {
        let node = ClientNode::builder()
            .sync_endpoint(Arc::new(NullEndpoint))
            .build()
            .unwrap();
        assert!(node.as_sync("ticketing").is_ok());
        let error = node.as_async("ticketing").unwrap_err();
        assert_eq!(
            error.to_string(),
            "remote plugin [ticketing] is not configured with an asynchronous network protocol"
        );
    }

    #[test]
    fn builder_requires_exactly_one_endpoint() {
        assert!(matches!(
            ClientNodeBuilder::new().build(),
            Err(NodeError::Config(_))
        ));
        assert!(matches!(
            ServerNodeBuilder::new().build(),
            Err(NodeError::Config(_))
        ));
    }
}
