//! Boundaries to the local resource layer.

use async_trait::async_trait;
use cardlink_protocol::{ErrorRecord, Message};

/// Receives decoded server-originated event payloads. Implementations are
/// called on the node's poll task (sync client) or channel task (async
/// nodes without an executor); keep them brief.
pub trait EventObserver: Send + Sync {
    fn on_plugin_event(&self, body: &str);
    fn on_reader_event(&self, body: &str);
}

/// Receives inbound application envelopes the node cannot pair with a
/// waiting request: new service executions, commands to run against the
/// local resource, observation start/stop notices. Implementations reply
/// through the node they are bound to.
///
/// Returning an `ErrorRecord` makes the node answer the requester with an
/// `ERROR` envelope carrying it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: Message) -> Result<(), ErrorRecord>;
}
