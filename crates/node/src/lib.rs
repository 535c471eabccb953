//! `cardlink-node`: the node/session engine binding a transport endpoint to
//! the CardLink envelope protocol.
//!
//! A node is one endpoint of the protocol, in one of four role/transport
//! combinations:
//!
//! - [`SyncClientNode`]: blocking round trips over a stateless
//!   request/response endpoint, plus poll-based event discovery.
//! - [`AsyncClientNode`]: a persistent duplex channel with a session-indexed
//!   waiter table and a per-request timeout.
//! - [`SyncServerNode`]: answers each inbound request synchronously, holding
//!   the caller up to an await timeout for the session's next outbound
//!   envelope or for buffered events.
//! - [`AsyncServerNode`]: one persistent channel per connected client node,
//!   addressed by the envelope's `clientNodeId`.
//!
//! The [`ClientNode`] and [`ServerNode`] façades select a variant at
//! construction time and fail fast when asked for the other kind.

pub mod async_client;
pub mod async_server;
pub mod endpoint;
pub mod node;
pub mod observer;
pub mod pending;
pub mod push;
pub mod session;
pub mod sync_client;
pub mod sync_server;

use std::time::Duration;

use cardlink_protocol::{Action, Message, ProtocolError, RemoteError};

pub use async_client::AsyncClientNode;
pub use async_server::{AsyncServerNode, ClientInfo};
pub use endpoint::{
    AsyncEndpointClient, ClientSink, EventExecutor, SyncEndpointClient, TokioExecutor,
};
pub use node::{
    ClientNode, ClientNodeBuilder, ServerNode, ServerNodeBuilder, DEFAULT_AWAIT_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use observer::{EventObserver, MessageHandler};
pub use pending::PendingRequests;
pub use push::{EventChannel, PushStrategy};
pub use session::{new_session_id, SessionRegistry};
pub use sync_client::SyncClientNode;
pub use sync_server::SyncServerNode;

/// Errors produced by the node layer.
#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Asynchronous client only: no reply arrived in time. Distinct from
    /// [`NodeError::Remote`] so callers can decide whether to retry.
    #[error("no reply within {timeout:?} for session [{session_id}]")]
    Timeout {
        session_id: String,
        timeout: Duration,
    },
    /// Synchronous server only: the held exchange produced nothing before
    /// the await timeout elapsed.
    #[error("no envelope ready within {timeout:?} for session [{session_id}]")]
    AwaitTimeout {
        session_id: String,
        timeout: Duration,
    },
    #[error("session [{0}] is already open")]
    SessionAlreadyOpen(String),
    #[error("session [{0}] was closed and cannot be reused")]
    SessionClosed(String),
    #[error("a request is already in flight for session [{0}]")]
    RequestAlreadyPending(String),
    #[error("client node [{0}] is not connected")]
    ClientNotConnected(String),
    #[error("client node [{client}] is not observing {channel} events")]
    NotObserving {
        client: String,
        channel: &'static str,
    },
    #[error("peer disconnected before replying in session [{0}]")]
    PeerDisconnected(String),
    #[error("remote plugin [{name}] is not configured with {expected} network protocol")]
    WrongNodeKind { name: String, expected: &'static str },
    #[error("observation of {0} events is not configured on this node")]
    ObservationNotConfigured(&'static str),
    #[error("config: {0}")]
    Config(String),
    #[error("endpoint failure: {0}")]
    Endpoint(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Converts an `ERROR` reply into the remote failure it carries; any other
/// reply passes through. `sendRequest` never hands an error envelope back
/// to the caller as a normal result.
pub fn check_reply(reply: Message) -> Result<Message> {
    if reply.action == Action::Error {
        Err(RemoteError::from_body(reply.body.as_deref()).into())
    } else {
        Ok(reply)
    }
}

pub(crate) fn require_session_id(message: &Message) -> Result<String> {
    message.session_id.clone().ok_or_else(|| {
        ProtocolError::Malformed(format!(
            "envelope with action {} carries no sessionId",
            message.action
        ))
        .into()
    })
}
