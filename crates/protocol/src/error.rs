//! Failures of the envelope layer, and the codec that carries a remote
//! failure across the process boundary.

use serde::{Deserialize, Serialize};

/// Failures of the envelope layer itself. Always fatal to the single call
/// that produced them, never retried.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("action {action} not supported by {role}")]
    UnsupportedAction { action: String, role: &'static str },
}

/// Transportable description of a remote failure: the original failure's
/// type name, its message, and an optionally chained cause. Travels as the
/// body of an `ERROR` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Type name of the original failure as reported by the remote side.
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorRecord>>,
}

impl ErrorRecord {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: ErrorRecord) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Captures `error` and its `source()` chain. Type names of chained
    /// sources are erased behind the trait object and recorded as
    /// `"unknown"`.
    pub fn wrap<E>(error: &E) -> Self
    where
        E: std::error::Error,
    {
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
            cause: error.source().map(|s| Box::new(Self::wrap_source(s))),
        }
    }

    fn wrap_source(error: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            kind: "unknown".to_string(),
            message: error.to_string(),
            cause: error.source().map(|s| Box::new(Self::wrap_source(s))),
        }
    }

    /// Serializes for transport. Never fails: a serialization failure
    /// degrades to a generic message-only record.
    pub fn to_body(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"kind":"unknown","message":"unserializable error record"}"#.to_string()
        })
    }
}

/// Cause chain reconstructed from an [`ErrorRecord`]. The exact original
/// type cannot be rebuilt across the process boundary; each link is a
/// generic error carrying the original type name and message.
#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct RemoteCause {
    pub kind: String,
    pub message: String,
    #[source]
    pub cause: Option<Box<RemoteCause>>,
}

impl RemoteCause {
    fn from_record(record: &ErrorRecord) -> Self {
        Self {
            kind: record.kind.clone(),
            message: record.message.clone(),
            cause: record
                .cause
                .as_deref()
                .map(|c| Box::new(Self::from_record(c))),
        }
    }
}

/// Error surfaced to a caller when the peer's application logic failed.
/// The display message matches the original failure's message.
#[derive(thiserror::Error, Debug)]
#[error("{}", .record.message)]
pub struct RemoteError {
    pub record: ErrorRecord,
    #[source]
    cause: RemoteCause,
}

impl RemoteError {
    pub fn new(record: ErrorRecord) -> Self {
        let cause = RemoteCause::from_record(&record);
        Self { record, cause }
    }

    /// Decodes an `ERROR` body. A missing or malformed payload produces a
    /// generic record rather than a decode failure.
    pub fn from_body(body: Option<&str>) -> Self {
        let record = body
            .and_then(|b| serde_json::from_str::<ErrorRecord>(b).ok())
            .unwrap_or_else(|| {
                ErrorRecord::new(
                    "unknown",
                    "remote execution failed with an unreadable error payload",
                )
            });
        Self::new(record)
    }

    /// The reconstructed cause chain.
    pub fn cause(&self) -> &RemoteCause {
        &self.cause
    }
}
