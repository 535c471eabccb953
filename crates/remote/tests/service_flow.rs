//! Integration test: wires a real [`PluginClient`] to a real
//! [`PluginServer`] over in-memory transports and runs the full service
//! handshake on both transport kinds.
//!
//! Covered end to end:
//! - `EXECUTE_REMOTE_SERVICE` creates exactly one reader binding and the
//!   observer learns about it
//! - the server drives the remote reader with `CMD` and the client answers
//!   from its local reader bridge
//! - `endRemoteService` removes the binding, notifies the observer, and
//!   carries the output payload back to the client
//! - a second `endRemoteService` with the same name is a local
//!   precondition error

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cardlink_node::{AsyncEndpointClient, SyncEndpointClient, SyncServerNode};
use cardlink_protocol::Message;
use cardlink_remote::{
    LocalReaderExecutor, PluginClient, PluginObserver, PluginServer, RemoteReaderBinding,
    ServiceError, ServiceRequest,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

// ── Local reader bridge: answers every command with 9000 ────────────────

struct NineThousand;

#[async_trait]
impl LocalReaderExecutor for NineThousand {
    async fn execute(&self, _body: &str) -> anyhow::Result<String> {
        Ok("9000".to_string())
    }
}

// ── Observer handing each new binding to the test ───────────────────────

struct NotifyingObserver {
    registered: mpsc::UnboundedSender<Arc<RemoteReaderBinding>>,
    unregistered: Mutex<Vec<String>>,
}

impl PluginObserver for NotifyingObserver {
    fn on_reader_registered(&self, reader: &Arc<RemoteReaderBinding>) {
        let _ = self.registered.send(Arc::clone(reader));
    }
    fn on_reader_unregistered(&self, remote_reader_name: &str) {
        self.unregistered.lock().push(remote_reader_name.to_string());
    }
    fn on_reader_event(&self, _body: &str) {}
}

// ── Transports ──────────────────────────────────────────────────────────

/// Synchronous loopback: each round trip calls straight into the server
/// node.
struct SyncLoopback {
    server: Arc<SyncServerNode>,
}

#[async_trait]
impl SyncEndpointClient for SyncLoopback {
    async fn transmit(&self, message: Message) -> anyhow::Result<Vec<Message>> {
        self.server
            .on_request(message)
            .await
            .map_err(anyhow::Error::new)
    }
}

/// Asynchronous outbound pipe; the pump task on the other end feeds the
/// peer node.
struct PipeEndpoint {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl AsyncEndpointClient for PipeEndpoint {
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        self.tx
            .send(message)
            .map_err(|_| anyhow::anyhow!("channel closed"))
    }
}

// ── The shared scenario ─────────────────────────────────────────────────

async fn run_service_scenario(
    server: Arc<PluginServer>,
    client: Arc<PluginClient>,
    mut registered: mpsc::UnboundedReceiver<Arc<RemoteReaderBinding>>,
    observer: Arc<NotifyingObserver>,
) {
    let service_task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .execute_remote_service(ServiceRequest::new("SVC1", "CSC_READER"))
                .await
        })
    };

    // The server application discovers the new binding.
    let binding = tokio::time::timeout(Duration::from_secs(2), registered.recv())
        .await
        .expect("timed out waiting for the binding")
        .expect("observer channel closed");
    assert_eq!(binding.service_id(), "SVC1");
    assert_eq!(binding.local_reader_name(), Some("CSC_READER"));
    assert!(binding.initial_content_raw().is_none());
    assert!(binding.input_data().is_none());
    assert_eq!(server.readers().len(), 1);

    // Drive the remote reader.
    let answer = server
        .execute_on_reader(binding.name(), "APDU")
        .await
        .unwrap();
    assert_eq!(answer.as_deref(), Some("9000"));

    // Finish and hand the output back.
    server
        .end_remote_service(binding.name(), Some(serde_json::json!({"status": "DONE"})))
        .await
        .unwrap();

    let outcome = service_task.await.unwrap().unwrap();
    assert_eq!(outcome.output, Some(serde_json::json!({"status": "DONE"})));
    assert_eq!(
        observer.unregistered.lock().as_slice(),
        [binding.name().to_string()]
    );
    assert!(server.readers().is_empty());

    // Ending twice is a local precondition error, not a network one.
    let error = server
        .end_remote_service(binding.name(), None)
        .await
        .unwrap_err();
    assert!(matches!(error, ServiceError::UnknownReader(_)));
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_service_flow_over_a_synchronous_transport() {
    let (registered_tx, registered_rx) = mpsc::unbounded_channel();
    let observer = Arc::new(NotifyingObserver {
        registered: registered_tx,
        unregistered: Mutex::new(Vec::new()),
    });

    let server = PluginServer::builder("ticketing")
        .sync_transport()
        .await_timeout(Duration::from_secs(2))
        .observer(observer.clone())
        .build()
        .unwrap();

    let client = Arc::new(
        PluginClient::builder("ticketing")
            .sync_endpoint(Arc::new(SyncLoopback {
                server: server.get_sync_node().unwrap(),
            }))
            .local_executor(Arc::new(NineThousand))
            .build()
            .unwrap(),
    );

    run_service_scenario(server, client, registered_rx, observer).await;
}

#[tokio::test]
async fn full_service_flow_over_an_asynchronous_transport() {
    let (registered_tx, registered_rx) = mpsc::unbounded_channel();
    let observer = Arc::new(NotifyingObserver {
        registered: registered_tx,
        unregistered: Mutex::new(Vec::new()),
    });

    let server = PluginServer::builder("ticketing")
        .async_transport()
        .observer(observer.clone())
        .build()
        .unwrap();
    let server_node = server.get_async_node().unwrap();

    // Client-to-server pipe.
    let (c2s_tx, mut c2s_rx) = mpsc::unbounded_channel();
    let client = Arc::new(
        PluginClient::builder("ticketing")
            .async_endpoint(Arc::new(PipeEndpoint { tx: c2s_tx }))
            .local_executor(Arc::new(NineThousand))
            .request_timeout(Duration::from_secs(2))
            .build()
            .unwrap(),
    );
    let client_node = client.get_async_node().unwrap();

    // Server-to-client channel, registered under the client's node id.
    let (s2c_tx, mut s2c_rx) = mpsc::channel(16);
    server_node.attach_client(client.node_id(), s2c_tx);

    // Pump tasks standing in for the network.
    {
        let server_node = Arc::clone(&server_node);
        tokio::spawn(async move {
            while let Some(message) = c2s_rx.recv().await {
                server_node.on_message(message);
            }
        });
    }
    {
        let client_node = Arc::clone(&client_node);
        tokio::spawn(async move {
            while let Some(message) = s2c_rx.recv().await {
                client_node.on_message(message);
            }
        });
    }

    run_service_scenario(server, client, registered_rx, observer).await;
}
