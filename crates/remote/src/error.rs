//! Errors of the handshake layer.

use cardlink_node::NodeError;
use cardlink_protocol::ErrorRecord;

use crate::content::ContentError;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    /// Local precondition violation, raised before any network interaction.
    #[error("no reader exists with name [{0}]")]
    UnknownReader(String),
    #[error("malformed service body: {0}")]
    MalformedBody(String),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("remote service ended with unexpected action {0}")]
    UnexpectedAction(String),
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Flattens an `anyhow` chain into a transportable record. Type names are
/// erased by `anyhow`, so every link reports `"unknown"`.
pub(crate) fn record_from_anyhow(error: &anyhow::Error) -> ErrorRecord {
    let messages: Vec<String> = error.chain().map(|e| e.to_string()).collect();
    let mut record: Option<ErrorRecord> = None;
    for message in messages.into_iter().rev() {
        let mut link = ErrorRecord::new("unknown", message);
        if let Some(cause) = record.take() {
            link = link.with_cause(cause);
        }
        record = Some(link);
    }
    record.unwrap_or_else(|| ErrorRecord::new("unknown", "unknown failure"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_chain_is_preserved() {
        let error = anyhow::anyhow!("root cause").context("while doing the thing");
        let record = record_from_anyhow(&error);
        assert_eq!(record.message, "while doing the thing");
        assert_eq!(record.cause.as_deref().map(|c| c.message.as_str()), Some("root cause"));
    }
}
