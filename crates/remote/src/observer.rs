//! Boundaries to the application on both sides of the handshake.

use std::sync::Arc;

use async_trait::async_trait;

use crate::binding::RemoteReaderBinding;

/// Server-side application callback. Registration notifications arrive on
/// the node's dispatch task (or through the node's executor when one is
/// configured).
pub trait PluginObserver: Send + Sync {
    /// A new remote reader binding was created for a service execution.
    fn on_reader_registered(&self, reader: &Arc<RemoteReaderBinding>);
    /// The binding was removed; the application must forget the name.
    fn on_reader_unregistered(&self, remote_reader_name: &str);
    /// A client-owned observable reader reported a state change.
    fn on_reader_event(&self, body: &str);
}

/// Server-side processor for raw commands sent outside any reader binding
/// (plugin-level traffic). The reply body rides back as `RESP`.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    async fn process(&self, body: &str) -> anyhow::Result<String>;
}

/// Client-side bridge to the hardware reader: runs one opaque command body
/// and returns the reply body.
#[async_trait]
pub trait LocalReaderExecutor: Send + Sync {
    async fn execute(&self, body: &str) -> anyhow::Result<String>;
}
