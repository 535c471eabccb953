//! `cardlink-protocol`: the wire-level message envelope exchanged between
//! CardLink nodes, and the codec used to carry failures across process
//! boundaries.
//!
//! Everything a node puts on the wire is a single [`Message`]: a flat JSON
//! object with an action tag, correlation identifiers, and an opaque string
//! body. Two generations of body field naming coexist (see [`BodyKey`]);
//! decoders select the scheme from the envelope's `apiLevel` field.

pub mod error;
pub mod message;

pub use error::{ErrorRecord, ProtocolError, RemoteCause, RemoteError};
pub use message::{Action, BodyKey, Message, API_LEVEL, CORE_API_LEVEL, CORE_API_LEVEL_UNKNOWN};
