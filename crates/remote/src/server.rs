//! Server side of the handshake: turns `EXECUTE_REMOTE_SERVICE` requests
//! into reader bindings, lets the application drive them, and tears them
//! down on `endRemoteService`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cardlink_node::{
    EventExecutor, EventObserver, MessageHandler, NodeError, ServerNode, SyncServerNode,
    AsyncServerNode, DEFAULT_AWAIT_TIMEOUT,
};
use cardlink_protocol::{
    Action, BodyKey, ErrorRecord, Message, ProtocolError, CORE_API_LEVEL_UNKNOWN,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use uuid::Uuid;

use crate::binding::{InitialContent, RemoteReaderBinding};
use crate::error::{record_from_anyhow, ServiceError};
use crate::observer::{CommandProcessor, PluginObserver};

/// Routes node-level reader events into the plugin observer.
struct ReaderEventForwarder {
    observer: Arc<dyn PluginObserver>,
}

impl EventObserver for ReaderEventForwarder {
    fn on_plugin_event(&self, body: &str) {
        tracing::warn!(body = %body, "unexpected plugin event on the server side");
    }

    fn on_reader_event(&self, body: &str) {
        self.observer.on_reader_event(body);
    }
}

/// The process that runs the business logic against readers it does not
/// physically own.
pub struct PluginServer {
    name: String,
    node: ServerNode,
    readers: RwLock<HashMap<String, Arc<RemoteReaderBinding>>>,
    observer: Arc<dyn PluginObserver>,
    command_processor: Option<Arc<dyn CommandProcessor>>,
    observing_clients: Mutex<HashSet<String>>,
}

impl PluginServer {
    pub fn builder(name: impl Into<String>) -> PluginServerBuilder {
        PluginServerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &ServerNode {
        &self.node
    }

    /// The synchronous node, for wiring the transport glue. Fails fast when
    /// the plugin was configured with the other kind.
    pub fn get_sync_node(&self) -> Result<Arc<SyncServerNode>, ServiceError> {
        Ok(Arc::clone(self.node.as_sync(&self.name)?))
    }

    pub fn get_async_node(&self) -> Result<Arc<AsyncServerNode>, ServiceError> {
        Ok(Arc::clone(self.node.as_async(&self.name)?))
    }

    /// Bindings currently open, in no particular order.
    pub fn readers(&self) -> Vec<Arc<RemoteReaderBinding>> {
        self.readers.read().values().cloned().collect()
    }

    pub fn reader(&self, remote_reader_name: &str) -> Option<Arc<RemoteReaderBinding>> {
        self.readers.read().get(remote_reader_name).cloned()
    }

    /// Runs an opaque command on the remote reader: a `CMD` request in the
    /// binding's session, answered by the client that owns the hardware.
    pub async fn execute_on_reader(
        &self,
        remote_reader_name: &str,
        body: impl Into<String>,
    ) -> Result<Option<String>, ServiceError> {
        let reader = self
            .reader(remote_reader_name)
            .ok_or_else(|| ServiceError::UnknownReader(remote_reader_name.to_string()))?;
        let mut message = Message::new(Action::Cmd)
            .with_api_level(reader.client_api_level())
            .with_remote_reader_name(remote_reader_name)
            .with_session_id(reader.session_id())
            .with_client_node_id(reader.client_node_id())
            .with_body(body);
        message.local_reader_name = reader.local_reader_name().map(str::to_string);
        let reply = self.node.send_request(message).await?;
        Ok(reply.body)
    }

    /// Ends the service execution: removes the binding, tells the observer
    /// to forget the reader, and sends `END_REMOTE_SERVICE` with the
    /// optional output payload. Removal and the outbound message are not
    /// transactional; a send failure is surfaced while the binding stays
    /// gone. An unknown name is a local precondition error raised before
    /// any network interaction.
    pub async fn end_remote_service(
        &self,
        remote_reader_name: &str,
        output_data: Option<Value>,
    ) -> Result<(), ServiceError> {
        let reader = self
            .readers
            .write()
            .remove(remote_reader_name)
            .ok_or_else(|| ServiceError::UnknownReader(remote_reader_name.to_string()))?;

        self.observer.on_reader_unregistered(remote_reader_name);

        let mut body = serde_json::Map::new();
        if reader.client_api_level() != 0 {
            if reader.client_core_api_level() > 0 {
                body.insert(
                    BodyKey::CoreApiLevel.key().to_string(),
                    Value::from(reader.client_core_api_level()),
                );
            }
            if let Some(output) = &output_data {
                body.insert(BodyKey::OutputData.key().to_string(), output.clone());
            }
        } else if let Some(output) = &output_data {
            // Legacy peers expect the output re-encoded as a string.
            body.insert(
                BodyKey::OutputData.legacy().to_string(),
                Value::String(output.to_string()),
            );
        }

        let message = Message::new(Action::EndRemoteService)
            .with_api_level(reader.client_api_level())
            .with_remote_reader_name(remote_reader_name)
            .with_session_id(reader.session_id())
            .with_client_node_id(reader.client_node_id())
            .with_body(Value::Object(body).to_string());

        tracing::info!(
            plugin = %self.name,
            remote_reader = %remote_reader_name,
            "remote service ended"
        );
        self.node.send_message(message).await?;
        Ok(())
    }

    /// Pushes a plugin-level event to every client currently observing.
    pub async fn notify_plugin_event(&self, body: impl Into<String>) {
        let body = body.into();
        let clients: Vec<String> = self.observing_clients.lock().iter().cloned().collect();
        for client_node_id in clients {
            let event = Message::new(Action::PluginEvent)
                .with_client_node_id(&client_node_id)
                .with_body(body.clone());
            if let Err(error) = self.node.send_message(event).await {
                tracing::warn!(
                    client_node_id = %client_node_id,
                    error = %error,
                    "failed to push a plugin event"
                );
            }
        }
    }

    /// Pushes a reader-level event to the client owning the binding.
    pub async fn notify_reader_event(
        &self,
        remote_reader_name: &str,
        body: impl Into<String>,
    ) -> Result<(), ServiceError> {
        let reader = self
            .reader(remote_reader_name)
            .ok_or_else(|| ServiceError::UnknownReader(remote_reader_name.to_string()))?;
        let event = Message::new(Action::ReaderEvent)
            .with_remote_reader_name(remote_reader_name)
            .with_client_node_id(reader.client_node_id())
            .with_body(body);
        self.node.send_message(event).await?;
        Ok(())
    }

    // ── Inbound ──────────────────────────────────────────────────────

    fn register_reader(&self, message: Message) -> Result<(), ServiceError> {
        let session_id = message.session_id.clone().ok_or_else(|| {
            ServiceError::MalformedBody("execution request without a sessionId".to_string())
        })?;
        let client_node_id = message.client_node_id.clone().ok_or_else(|| {
            ServiceError::MalformedBody("execution request without a clientNodeId".to_string())
        })?;
        let api_level = message.api_level;
        let body: Value = serde_json::from_str(message.body.as_deref().unwrap_or(""))
            .map_err(|e| ServiceError::MalformedBody(e.to_string()))?;

        let core_api_level = if api_level == 0 {
            0
        } else {
            BodyKey::CoreApiLevel
                .get(&body, api_level)
                .and_then(Value::as_i64)
                .map(|v| v as i32)
                .unwrap_or(CORE_API_LEVEL_UNKNOWN)
        };
        let service_id = BodyKey::ServiceId
            .get(&body, api_level)
            .and_then(Value::as_str)
            .ok_or(ServiceError::MissingField("serviceId"))?
            .to_string();
        let input_data = match BodyKey::InputData.get(&body, api_level) {
            None => None,
            Some(value) if api_level != 0 => Some(value.clone()),
            Some(value) => Some(parse_embedded(value)?),
        };
        let initial_content = match BodyKey::InitialContent.get(&body, api_level) {
            None => None,
            Some(value) => {
                let tag = BodyKey::InitialContentTag
                    .get(&body, api_level)
                    .and_then(Value::as_str)
                    .ok_or(ServiceError::MissingField("initialCardContentTag"))?
                    .to_string();
                let value = if api_level != 0 {
                    value.clone()
                } else {
                    parse_embedded(value)?
                };
                Some(InitialContent { tag, value })
            }
        };
        let observable = BodyKey::IsReaderObservable
            .get(&body, api_level)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let remote_reader_name = Uuid::new_v4().to_string();
        tracing::info!(
            plugin = %self.name,
            remote_reader = %remote_reader_name,
            service_id = %service_id,
            session_id = %session_id,
            client_node_id = %client_node_id,
            "created a remote reader binding"
        );

        let binding = Arc::new(RemoteReaderBinding {
            remote_reader_name: remote_reader_name.clone(),
            local_reader_name: message.local_reader_name.clone(),
            session_id,
            client_node_id,
            service_id,
            input_data,
            initial_content,
            observable,
            client_api_level: api_level,
            client_core_api_level: core_api_level,
        });
        self.readers
            .write()
            .insert(remote_reader_name, Arc::clone(&binding));
        self.observer.on_reader_registered(&binding);
        Ok(())
    }

    async fn process_command(&self, message: Message) -> Result<(), ErrorRecord> {
        let Some(processor) = &self.command_processor else {
            return Err(ErrorRecord::new(
                "ServiceError",
                format!("plugin [{}] has no command processor", self.name),
            ));
        };
        let body = message.body.as_deref().unwrap_or("");
        match processor.process(body).await {
            Ok(reply_body) => {
                let mut reply = Message::new(Action::Resp).with_body(reply_body);
                reply.session_id = message.session_id.clone();
                reply.client_node_id = message.client_node_id.clone();
                reply.local_reader_name = message.local_reader_name.clone();
                reply.remote_reader_name = message.remote_reader_name.clone();
                self.node
                    .send_message(reply)
                    .await
                    .map_err(|e| ErrorRecord::wrap(&e))
            }
            Err(error) => Err(record_from_anyhow(&error)),
        }
    }
}

#[async_trait]
impl MessageHandler for PluginServer {
    async fn on_message(&self, message: Message) -> Result<(), ErrorRecord> {
        match message.action {
            Action::ExecuteRemoteService => self
                .register_reader(message)
                .map_err(|e| ErrorRecord::wrap(&e)),
            Action::Cmd => self.process_command(message).await,
            Action::StartPluginsObservation => {
                if let Some(client_node_id) = message.client_node_id {
                    tracing::debug!(client_node_id = %client_node_id, "client observes plugin events");
                    self.observing_clients.lock().insert(client_node_id);
                }
                Ok(())
            }
            Action::StopPluginsObservation => {
                if let Some(client_node_id) = message.client_node_id {
                    self.observing_clients.lock().remove(&client_node_id);
                }
                Ok(())
            }
            Action::ReaderEvent => {
                self.observer
                    .on_reader_event(message.body.as_deref().unwrap_or(""));
                Ok(())
            }
            other => Err(ErrorRecord::wrap(&NodeError::Protocol(
                ProtocolError::UnsupportedAction {
                    action: other.as_str().to_string(),
                    role: "plugin server",
                },
            ))),
        }
    }
}

/// A legacy peer embeds nested JSON as a string; unwrap it.
fn parse_embedded(value: &Value) -> Result<Value, ServiceError> {
    let text = value.as_str().ok_or_else(|| {
        ServiceError::MalformedBody("legacy payload fields must be strings".to_string())
    })?;
    serde_json::from_str(text).map_err(|e| ServiceError::MalformedBody(e.to_string()))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    Sync,
    Async,
}

pub struct PluginServerBuilder {
    name: String,
    kind: Option<TransportKind>,
    await_timeout: Duration,
    executor: Option<Arc<dyn EventExecutor>>,
    observer: Option<Arc<dyn PluginObserver>>,
    command_processor: Option<Arc<dyn CommandProcessor>>,
}

impl PluginServerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            await_timeout: DEFAULT_AWAIT_TIMEOUT,
            executor: None,
            observer: None,
            command_processor: None,
        }
    }

    /// Serve a stateless request/response transport.
    pub fn sync_transport(mut self) -> Self {
        self.kind = Some(TransportKind::Sync);
        self
    }

    /// Serve persistent duplex channels.
    pub fn async_transport(mut self) -> Self {
        self.kind = Some(TransportKind::Async);
        self
    }

    /// Hold duration of the synchronous server (default 20s).
    pub fn await_timeout(mut self, timeout: Duration) -> Self {
        self.await_timeout = timeout;
        self
    }

    /// Executor decoupling event notification from the channel task.
    pub fn executor(mut self, executor: Arc<dyn EventExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Required: receiver of binding lifecycle and reader events.
    pub fn observer(mut self, observer: Arc<dyn PluginObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Processor for plugin-level commands sent outside any binding.
    pub fn command_processor(mut self, processor: Arc<dyn CommandProcessor>) -> Self {
        self.command_processor = Some(processor);
        self
    }

    pub fn build(self) -> Result<Arc<PluginServer>, ServiceError> {
        let observer = self
            .observer
            .ok_or_else(|| ServiceError::Config("a plugin observer is required".to_string()))?;
        let kind = self
            .kind
            .ok_or_else(|| ServiceError::Config("a transport kind is required".to_string()))?;

        let mut node_builder = ServerNode::builder();
        node_builder = match kind {
            TransportKind::Sync => node_builder.sync_transport().await_timeout(self.await_timeout),
            TransportKind::Async => {
                let forwarder = Arc::new(ReaderEventForwarder {
                    observer: Arc::clone(&observer),
                });
                let mut builder = node_builder.async_transport().observer(forwarder);
                if let Some(executor) = self.executor {
                    builder = builder.executor(executor);
                }
                builder
            }
        };
        let node = node_builder.build()?;

        tracing::info!(
            plugin = %self.name,
            node_kind = if node.is_sync() { "sync" } else { "async" },
            "plugin server created"
        );

        let server = Arc::new_cyclic(|me: &Weak<PluginServer>| {
            let handler: Weak<dyn MessageHandler> = me.clone();
            node.bind_handler(handler);
            PluginServer {
                name: self.name,
                node: node.clone(),
                readers: RwLock::new(HashMap::new()),
                observer,
                command_processor: self.command_processor,
                observing_clients: Mutex::new(HashSet::new()),
            }
        });
        Ok(server)
    }
}
