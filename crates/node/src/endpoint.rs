//! Transport endpoint boundaries.
//!
//! Concrete transports (an HTTP client, a WebSocket handler, an in-process
//! pipe) live with the application; the node engine only ever sees these
//! traits. Inbound delivery on the asynchronous transports is the glue's
//! responsibility: it calls `on_message` on the owning node.

use async_trait::async_trait;
use cardlink_protocol::Message;
use tokio::sync::mpsc;

/// Stateless request/response endpoint used by the synchronous client
/// node. One `transmit` is one full network round trip; the server may
/// answer with zero, one, or several envelopes (event polls return
/// batches).
#[async_trait]
pub trait SyncEndpointClient: Send + Sync {
    async fn transmit(&self, message: Message) -> anyhow::Result<Vec<Message>>;
}

/// Outbound half of the persistent duplex channel owned by the
/// asynchronous client node.
#[async_trait]
pub trait AsyncEndpointClient: Send + Sync {
    async fn send(&self, message: Message) -> anyhow::Result<()>;
}

/// Outbound half of one connected client's duplex channel, as held by the
/// asynchronous server node.
pub type ClientSink = mpsc::Sender<Message>;

/// Decouples observer notification from the channel-reading task on the
/// asynchronous server. Without one, notification runs inline and slow
/// observers are the caller's responsibility.
pub trait EventExecutor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs observer notifications on the tokio blocking pool.
pub struct TokioExecutor;

impl EventExecutor for TokioExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        tokio::task::spawn_blocking(task);
    }
}
