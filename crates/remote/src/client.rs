//! Client side of the handshake: the process that physically owns the
//! reader and lends it to the server for one service execution.

use std::sync::Arc;
use std::time::Duration;

use cardlink_node::{
    new_session_id, AsyncClientNode, AsyncEndpointClient, ClientNode, EventObserver, PushStrategy,
    SyncClientNode, SyncEndpointClient, DEFAULT_REQUEST_TIMEOUT,
};
use cardlink_protocol::{Action, BodyKey, Message, CORE_API_LEVEL};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::binding::InitialContent;
use crate::error::{record_from_anyhow, ServiceError};
use crate::observer::LocalReaderExecutor;

/// One service execution request: the service to run server-side, the
/// local reader to reflect, and the optional payloads that travel with it.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub service_id: String,
    pub local_reader_name: String,
    pub initial_content: Option<InitialContent>,
    pub input_data: Option<Value>,
}

impl ServiceRequest {
    pub fn new(service_id: impl Into<String>, local_reader_name: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            local_reader_name: local_reader_name.into(),
            initial_content: None,
            input_data: None,
        }
    }

    /// Attach the reader's current resource state, typed by `tag`.
    pub fn with_initial_content(mut self, tag: impl Into<String>, value: Value) -> Self {
        self.initial_content = Some(InitialContent {
            tag: tag.into(),
            value,
        });
        self
    }

    pub fn with_input_data(mut self, value: Value) -> Self {
        self.input_data = Some(value);
        self
    }
}

/// What the server returned on `END_REMOTE_SERVICE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOutcome {
    pub output: Option<Value>,
}

impl ServiceOutcome {
    pub fn output_as<T>(&self) -> Result<Option<T>, ServiceError>
    where
        T: DeserializeOwned,
    {
        match &self.output {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| ServiceError::MalformedBody(e.to_string())),
        }
    }
}

/// Client-side façade over a [`ClientNode`].
pub struct PluginClient {
    name: String,
    node: ClientNode,
    local_executor: Option<Arc<dyn LocalReaderExecutor>>,
}

impl PluginClient {
    pub fn builder(name: impl Into<String>) -> PluginClientBuilder {
        PluginClientBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &ClientNode {
        &self.node
    }

    pub fn node_id(&self) -> &str {
        self.node.node_id()
    }

    pub fn get_sync_node(&self) -> Result<Arc<SyncClientNode>, ServiceError> {
        Ok(Arc::clone(self.node.as_sync(&self.name)?))
    }

    pub fn get_async_node(&self) -> Result<Arc<AsyncClientNode>, ServiceError> {
        Ok(Arc::clone(self.node.as_async(&self.name)?))
    }

    /// Asks the server to bind this client's reader and run `service_id`,
    /// then answers every server-initiated command against the local
    /// reader until the server ends the service. Over a synchronous
    /// transport the whole exchange runs in one ephemeral session, closed
    /// best-effort on every exit path; over an asynchronous transport it
    /// uses the node-lifetime global session.
    pub async fn execute_remote_service(
        &self,
        request: ServiceRequest,
    ) -> Result<ServiceOutcome, ServiceError> {
        if self.node.is_sync() {
            let session_id = new_session_id();
            self.node.open_session(&session_id)?;
            let result = self.run_service(&request, &session_id).await;
            self.node.close_session_silently(&session_id);
            result
        } else {
            let session_id = self.node.open_global_session();
            self.run_service(&request, &session_id).await
        }
    }

    async fn run_service(
        &self,
        request: &ServiceRequest,
        session_id: &str,
    ) -> Result<ServiceOutcome, ServiceError> {
        let mut body = serde_json::Map::new();
        body.insert(
            BodyKey::ServiceId.key().to_string(),
            Value::String(request.service_id.clone()),
        );
        body.insert(
            BodyKey::CoreApiLevel.key().to_string(),
            Value::from(CORE_API_LEVEL),
        );
        if let Some(input) = &request.input_data {
            body.insert(BodyKey::InputData.key().to_string(), input.clone());
        }
        if let Some(content) = &request.initial_content {
            body.insert(
                BodyKey::InitialContent.key().to_string(),
                content.value.clone(),
            );
            body.insert(
                BodyKey::InitialContentTag.key().to_string(),
                Value::String(content.tag.clone()),
            );
        }

        let message = Message::new(Action::ExecuteRemoteService)
            .with_session_id(session_id)
            .with_local_reader_name(&request.local_reader_name)
            .with_body(Value::Object(body).to_string());

        let mut reply = self.node.send_request(message).await?;
        loop {
            match reply.action {
                Action::Cmd => {
                    let next = self.answer_command(&reply, session_id).await?;
                    reply = self.node.send_request(next).await?;
                }
                Action::EndRemoteService => {
                    return Ok(ServiceOutcome {
                        output: parse_output(&reply)?,
                    });
                }
                other => {
                    return Err(ServiceError::UnexpectedAction(other.as_str().to_string()));
                }
            }
        }
    }

    /// Runs one server command against the local reader. A local failure
    /// travels back as an `ERROR` envelope so the server-side caller sees
    /// the original message.
    async fn answer_command(
        &self,
        command: &Message,
        session_id: &str,
    ) -> Result<Message, ServiceError> {
        let executor = self.local_executor.as_ref().ok_or_else(|| {
            ServiceError::Config(format!("plugin [{}] has no local reader executor", self.name))
        })?;
        let mut next = match executor
            .execute(command.body.as_deref().unwrap_or(""))
            .await
        {
            Ok(result) => Message::new(Action::Resp).with_body(result),
            Err(error) => {
                Message::new(Action::Error).with_body(record_from_anyhow(&error).to_body())
            }
        };
        next.session_id = Some(session_id.to_string());
        next.remote_reader_name = command.remote_reader_name.clone();
        next.local_reader_name = command.local_reader_name.clone();
        Ok(next)
    }

    /// Sends a raw command outside any reader binding and returns the reply
    /// body. Ephemeral session per call on a synchronous node, the global
    /// session otherwise.
    pub async fn execute_remotely(
        &self,
        body: impl Into<String>,
    ) -> Result<Option<String>, ServiceError> {
        let body = body.into();
        if self.node.is_sync() {
            let session_id = new_session_id();
            self.node.open_session(&session_id)?;
            let result = self.send_command(body, &session_id).await;
            self.node.close_session_silently(&session_id);
            result
        } else {
            let session_id = self.node.open_global_session();
            self.send_command(body, &session_id).await
        }
    }

    async fn send_command(
        &self,
        body: String,
        session_id: &str,
    ) -> Result<Option<String>, ServiceError> {
        let message = Message::new(Action::Cmd)
            .with_session_id(session_id)
            .with_body(body);
        let reply = self.node.send_request(message).await?;
        Ok(reply.body)
    }

    // ── Observation ──────────────────────────────────────────────────

    pub async fn start_plugin_observation(&self) -> Result<(), ServiceError> {
        self.node.start_plugin_observation().await?;
        Ok(())
    }

    pub async fn stop_plugin_observation(&self) {
        self.node.stop_plugin_observation().await;
    }

    pub async fn start_reader_observation(&self) -> Result<(), ServiceError> {
        self.node.start_reader_observation().await?;
        Ok(())
    }

    pub async fn stop_reader_observation(&self) {
        self.node.stop_reader_observation().await;
    }

    /// Plugin teardown: closes the global session, if one was ever opened.
    /// Never fails; cleanup problems are logged by the node.
    pub fn on_unregister(&self) {
        if let Some(session_id) = self.node.global_session() {
            self.node.close_session_silently(&session_id);
        }
    }
}

fn parse_output(reply: &Message) -> Result<Option<Value>, ServiceError> {
    let Some(body) = reply.body.as_deref() else {
        return Ok(None);
    };
    if body.is_empty() {
        return Ok(None);
    }
    let value: Value =
        serde_json::from_str(body).map_err(|e| ServiceError::MalformedBody(e.to_string()))?;
    match BodyKey::OutputData.get(&value, reply.api_level) {
        None | Some(Value::Null) => Ok(None),
        Some(output) if reply.api_level != 0 => Ok(Some(output.clone())),
        Some(output) => {
            // Legacy peers re-encode the output as a string.
            let text = output.as_str().ok_or_else(|| {
                ServiceError::MalformedBody("legacy output data must be a string".to_string())
            })?;
            serde_json::from_str(text)
                .map(Some)
                .map_err(|e| ServiceError::MalformedBody(e.to_string()))
        }
    }
}

/// Builder for [`PluginClient`]. Exactly one endpoint kind must be
/// supplied; observation strategies only apply to the synchronous kind.
pub struct PluginClientBuilder {
    name: String,
    sync_endpoint: Option<Arc<dyn SyncEndpointClient>>,
    async_endpoint: Option<Arc<dyn AsyncEndpointClient>>,
    request_timeout: Duration,
    plugin_strategy: Option<PushStrategy>,
    reader_strategy: Option<PushStrategy>,
    observer: Option<Arc<dyn EventObserver>>,
    local_executor: Option<Arc<dyn LocalReaderExecutor>>,
}

impl PluginClientBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sync_endpoint: None,
            async_endpoint: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            plugin_strategy: None,
            reader_strategy: None,
            observer: None,
            local_executor: None,
        }
    }

    pub fn sync_endpoint(mut self, endpoint: Arc<dyn SyncEndpointClient>) -> Self {
        self.sync_endpoint = Some(endpoint);
        self
    }

    pub fn async_endpoint(mut self, endpoint: Arc<dyn AsyncEndpointClient>) -> Self {
        self.async_endpoint = Some(endpoint);
        self
    }

    /// Reply timeout of the asynchronous node (default 10s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn plugin_observation(mut self, strategy: PushStrategy) -> Self {
        self.plugin_strategy = Some(strategy);
        self
    }

    pub fn reader_observation(mut self, strategy: PushStrategy) -> Self {
        self.reader_strategy = Some(strategy);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Bridge to the hardware reader answering server commands.
    pub fn local_executor(mut self, executor: Arc<dyn LocalReaderExecutor>) -> Self {
        self.local_executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<PluginClient, ServiceError> {
        let mut builder = ClientNode::builder().request_timeout(self.request_timeout);
        if let Some(endpoint) = self.sync_endpoint {
            builder = builder.sync_endpoint(endpoint);
        }
        if let Some(endpoint) = self.async_endpoint {
            builder = builder.async_endpoint(endpoint);
        }
        if let Some(strategy) = self.plugin_strategy {
            builder = builder.plugin_observation(strategy);
        }
        if let Some(strategy) = self.reader_strategy {
            builder = builder.reader_observation(strategy);
        }
        if let Some(observer) = self.observer {
            builder = builder.observer(observer);
        }
        let node = builder.build()?;
        tracing::info!(
            plugin = %self.name,
            node_kind = if node.is_sync() { "sync" } else { "async" },
            "plugin client created"
        );
        Ok(PluginClient {
            name: self.name,
            node,
            local_executor: self.local_executor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cardlink_protocol::ErrorRecord;
    use parking_lot::Mutex;

    /// A scripted synchronous peer: pops the next reply for each request.
    struct ScriptedEndpoint {
        requests: Mutex<Vec<Message>>,
        replies: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl SyncEndpointClient for ScriptedEndpoint {
        async fn transmit(&self, message: Message) -> anyhow::Result<Vec<Message>> {
            self.requests.lock().push(message);
            let reply = self.replies.lock().remove(0);
            Ok(vec![reply])
        }
    }

    struct NineThousand;

    #[async_trait]
    impl LocalReaderExecutor for NineThousand {
        async fn execute(&self, _body: &str) -> anyhow::Result<String> {
            Ok("9000".to_string())
        }
    }

    fn client_with(replies: Vec<Message>) -> (PluginClient, Arc<ScriptedEndpoint>) {
        let endpoint = Arc::new(ScriptedEndpoint {
            requests: Mutex::new(Vec::new()),
            replies: Mutex::new(replies),
        });
        let client = PluginClient::builder("ticketing")
            .sync_endpoint(endpoint.clone())
            .local_executor(Arc::new(NineThousand))
            .build()
            .unwrap();
        (client, endpoint)
    }

    #[tokio::test]
    async fn service_loop_answers_commands_until_the_end() {
        let cmd = Message::new(Action::Cmd)
            .with_remote_reader_name("R1")
            .with_body("APDU");
        let end = Message::new(Action::EndRemoteService)
            .with_body(r#"{"outputData":{"status":"DONE"}}"#);
        let (client, endpoint) = client_with(vec![cmd, end]);

        let outcome = client
            .execute_remote_service(ServiceRequest::new("SVC1", "CSC_READER"))
            .await
            .unwrap();
        assert_eq!(outcome.output, Some(serde_json::json!({"status": "DONE"})));

        let requests = endpoint.requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].action, Action::ExecuteRemoteService);
        let body: Value = serde_json::from_str(requests[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["serviceId"], "SVC1");
        assert_eq!(body["coreApiLevel"], CORE_API_LEVEL);
        assert_eq!(requests[0].local_reader_name.as_deref(), Some("CSC_READER"));
        // The command answer rides in the same session, scoped to the
        // binding.
        assert_eq!(requests[1].action, Action::Resp);
        assert_eq!(requests[1].body.as_deref(), Some("9000"));
        assert_eq!(requests[1].session_id, requests[0].session_id);
        assert_eq!(requests[1].remote_reader_name.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn remote_error_reply_fails_the_service() {
        let error = Message::new(Action::Error)
            .with_body(ErrorRecord::new("IllegalStateException", "boom").to_body());
        let (client, _endpoint) = client_with(vec![error]);

        let failure = client
            .execute_remote_service(ServiceRequest::new("SVC1", "CSC_READER"))
            .await
            .unwrap_err();
        match failure {
            ServiceError::Node(cardlink_node::NodeError::Remote(remote)) => {
                assert_eq!(remote.to_string(), "boom");
            }
            other => panic!("expected a remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn legacy_end_body_is_understood() {
        let end = Message::new(Action::EndRemoteService)
            .with_api_level(0)
            .with_body(r#"{"USER_OUTPUT_DATA":"{\"status\":\"DONE\"}"}"#);
        let (client, _endpoint) = client_with(vec![end]);

        let outcome = client
            .execute_remote_service(ServiceRequest::new("SVC1", "CSC_READER"))
            .await
            .unwrap();
        assert_eq!(outcome.output, Some(serde_json::json!({"status": "DONE"})));
    }

    #[tokio::test]
    async fn raw_commands_use_an_ephemeral_session() {
        let resp = Message::new(Action::Resp).with_body("PONG");
        let (client, endpoint) = client_with(vec![resp]);

        let reply = client.execute_remotely("PING").await.unwrap();
        assert_eq!(reply.as_deref(), Some("PONG"));
        let session_id = endpoint.requests.lock()[0].session_id.clone().unwrap();
        // The ephemeral session is closed after the call.
        let node = client.get_sync_node().unwrap();
        assert!(node.open_session(&session_id).is_err());
    }

    #[test]
    fn wrong_kind_accessor_names_the_plugin() {
        let (client, _endpoint) = client_with(vec![]);
        let error = client.get_async_node().unwrap_err();
        assert_eq!(
            error.to_string(),
            "remote plugin [ticketing] is not configured with an asynchronous network protocol"
        );
    }
}
