//! Client-side strategies for discovering server-originated events over a
//! transport with no native push.

use std::time::Duration;

use cardlink_protocol::{Action, BodyKey, ProtocolError};
use serde_json::json;

/// The two observation channels a client can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventChannel {
    Plugin,
    Reader,
}

impl EventChannel {
    /// Action used both for the poll request naming this channel and for
    /// the event envelopes flowing back.
    pub fn action(self) -> Action {
        match self {
            EventChannel::Plugin => Action::PluginEvent,
            EventChannel::Reader => Action::ReaderEvent,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventChannel::Plugin => "plugin",
            EventChannel::Reader => "reader",
        }
    }
}

/// How a client discovers server-initiated events. Chosen once per
/// observation channel at node construction, never mutated afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStrategy {
    /// Issue a poll request every `interval`; each reply carries zero or
    /// more buffered events.
    Polling { interval: Duration },
    /// Issue a request the server may hold open up to `timeout` waiting
    /// for an event before returning empty.
    LongPolling { timeout: Duration },
}

impl PushStrategy {
    fn kind(&self) -> &'static str {
        match self {
            PushStrategy::Polling { .. } => "POLLING",
            PushStrategy::LongPolling { .. } => "LONG_POLLING",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            PushStrategy::Polling { interval } => *interval,
            PushStrategy::LongPolling { timeout } => *timeout,
        }
    }

    /// Body of a poll request: the strategy kind and its duration in
    /// milliseconds, under the current-scheme keys.
    pub fn encode_body(&self) -> String {
        json!({
            "strategy": self.kind(),
            "duration": self.duration().as_millis() as u64,
        })
        .to_string()
    }

    /// Parses a poll-request body under the scheme selected by `api_level`.
    pub fn decode_body(body: &str, api_level: i32) -> Result<PushStrategy, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = BodyKey::Strategy
            .get(&value, api_level)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProtocolError::Malformed("poll body without strategy".to_string()))?;
        let millis = BodyKey::Duration
            .get(&value, api_level)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ProtocolError::Malformed("poll body without duration".to_string()))?;
        let duration = Duration::from_millis(millis);
        match kind {
            "POLLING" => Ok(PushStrategy::Polling { interval: duration }),
            "LONG_POLLING" => Ok(PushStrategy::LongPolling { timeout: duration }),
            other => Err(ProtocolError::Malformed(format!(
                "unknown push strategy: {other}"
            ))),
        }
    }

    /// True when `body` looks like a poll request rather than an event
    /// payload. Poll requests and client-pushed events share the event
    /// actions on the wire; the strategy field disambiguates.
    pub fn is_poll_body(body: Option<&str>, api_level: i32) -> bool {
        let Some(body) = body else { return false };
        serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .map(|v| BodyKey::Strategy.get(&v, api_level).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_body_round_trip() {
        let strategy = PushStrategy::LongPolling {
            timeout: Duration::from_millis(2500),
        };
        let body = strategy.encode_body();
        assert_eq!(PushStrategy::decode_body(&body, 2).unwrap(), strategy);
        assert!(PushStrategy::is_poll_body(Some(&body), 2));
    }

    #[test]
    fn legacy_poll_body_is_accepted() {
        let body = r#"{"STRATEGY":"POLLING","DURATION":50}"#;
        assert_eq!(
            PushStrategy::decode_body(body, 0).unwrap(),
            PushStrategy::Polling {
                interval: Duration::from_millis(50)
            }
        );
    }

    #[test]
    fn event_payloads_are_not_polls() {
        assert!(!PushStrategy::is_poll_body(Some(r#"{"readerEvent":"CARD_INSERTED"}"#), 2));
        assert!(!PushStrategy::is_poll_body(None, 2));
        assert!(!PushStrategy::is_poll_body(Some("not json"), 2));
    }
}
