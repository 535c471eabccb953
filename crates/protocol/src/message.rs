//! Message envelope and its action vocabulary.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Protocol generation written into the `apiLevel` field of every envelope
/// built by this library. Peers that predate envelope versioning send no
/// `apiLevel` at all; decoders treat that as `0`.
pub const API_LEVEL: i32 = 2;

/// Generation of the local resource layer, carried inside service bodies as
/// `coreApiLevel`.
pub const CORE_API_LEVEL: i32 = 2;

/// Sentinel for a peer whose core-layer level was not communicated. `0` is
/// reserved for pre-versioning peers; `-1` means "current scheme, level
/// unknown".
pub const CORE_API_LEVEL_UNKNOWN: i32 = -1;

/// Closed action vocabulary. Decoding any other string is a
/// [`ProtocolError::UnknownAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Opaque command forwarded to the resource layer.
    Cmd,
    /// Successful reply to `CMD`.
    Resp,
    /// Failed reply; the body holds an [`ErrorRecord`](crate::ErrorRecord).
    Error,
    /// Client asks the server to bind a remote reader and run a named service.
    ExecuteRemoteService,
    /// Server signals service completion; the body may carry output data.
    EndRemoteService,
    /// Server-to-client notification of a reader state change.
    ReaderEvent,
    /// Server-to-client notification of a plugin state change.
    PluginEvent,
    /// Client wants plugin-level notifications from now on.
    StartPluginsObservation,
    /// Client no longer wants plugin-level notifications.
    StopPluginsObservation,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Cmd => "CMD",
            Action::Resp => "RESP",
            Action::Error => "ERROR",
            Action::ExecuteRemoteService => "EXECUTE_REMOTE_SERVICE",
            Action::EndRemoteService => "END_REMOTE_SERVICE",
            Action::ReaderEvent => "READER_EVENT",
            Action::PluginEvent => "PLUGIN_EVENT",
            Action::StartPluginsObservation => "START_PLUGINS_OBSERVATION",
            Action::StopPluginsObservation => "STOP_PLUGINS_OBSERVATION",
        }
    }

    pub fn parse(value: &str) -> Result<Action, ProtocolError> {
        match value {
            "CMD" => Ok(Action::Cmd),
            "RESP" => Ok(Action::Resp),
            "ERROR" => Ok(Action::Error),
            "EXECUTE_REMOTE_SERVICE" => Ok(Action::ExecuteRemoteService),
            "END_REMOTE_SERVICE" => Ok(Action::EndRemoteService),
            "READER_EVENT" => Ok(Action::ReaderEvent),
            "PLUGIN_EVENT" => Ok(Action::PluginEvent),
            "START_PLUGINS_OBSERVATION" => Ok(Action::StartPluginsObservation),
            "STOP_PLUGINS_OBSERVATION" => Ok(Action::StopPluginsObservation),
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }

    /// Event actions are dispatched to the observer and never touch the
    /// pending-request table.
    pub fn is_event(self) -> bool {
        matches!(self, Action::PluginEvent | Action::ReaderEvent)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single unit ever placed on the wire.
///
/// Every request-type envelope carries a `sessionId`; every response-type
/// envelope echoes the same `sessionId` and a non-empty `serverNodeId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Sender's protocol generation; `0` (and absent on the wire) means a
    /// pre-versioning peer whose bodies use legacy field names.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub api_level: i32,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_reader_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_reader_name: Option<String>,
    /// Opaque application payload, usually itself a JSON document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl Message {
    pub fn new(action: Action) -> Self {
        Self {
            api_level: API_LEVEL,
            action,
            client_node_id: None,
            server_node_id: None,
            session_id: None,
            local_reader_name: None,
            remote_reader_name: None,
            body: None,
        }
    }

    pub fn with_api_level(mut self, api_level: i32) -> Self {
        self.api_level = api_level;
        self
    }

    pub fn with_client_node_id(mut self, id: impl Into<String>) -> Self {
        self.client_node_id = Some(id.into());
        self
    }

    pub fn with_server_node_id(mut self, id: impl Into<String>) -> Self {
        self.server_node_id = Some(id.into());
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_local_reader_name(mut self, name: impl Into<String>) -> Self {
        self.local_reader_name = Some(name.into());
        self
    }

    pub fn with_remote_reader_name(mut self, name: impl Into<String>) -> Self {
        self.remote_reader_name = Some(name.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes to the wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parses the wire form. An action string outside the closed vocabulary
    /// is rejected as [`ProtocolError::UnknownAction`] rather than a generic
    /// parse failure.
    pub fn decode(wire: &str) -> Result<Message, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(wire).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        match value.get("action").and_then(|a| a.as_str()) {
            Some(action) => {
                Action::parse(action)?;
            }
            None => return Err(ProtocolError::Malformed("missing action field".to_string())),
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Logical body fields addressable under both wire generations.
///
/// A body built by a current peer (`apiLevel` non-zero) uses the short
/// camelCase keys; a pre-versioning peer uses the bare symbolic names. Both
/// readers are retained indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKey {
    ServiceId,
    InputData,
    OutputData,
    InitialContent,
    InitialContentTag,
    IsReaderObservable,
    ReaderEvent,
    CoreApiLevel,
    Strategy,
    Duration,
}

impl BodyKey {
    /// Current-scheme key.
    pub fn key(self) -> &'static str {
        match self {
            BodyKey::ServiceId => "serviceId",
            BodyKey::InputData => "inputData",
            BodyKey::OutputData => "outputData",
            BodyKey::InitialContent => "initialCardContent",
            BodyKey::InitialContentTag => "initialCardContentTag",
            BodyKey::IsReaderObservable => "isReaderObservable",
            BodyKey::ReaderEvent => "readerEvent",
            BodyKey::CoreApiLevel => "coreApiLevel",
            BodyKey::Strategy => "strategy",
            BodyKey::Duration => "duration",
        }
    }

    /// Legacy-scheme key.
    pub fn legacy(self) -> &'static str {
        match self {
            BodyKey::ServiceId => "SERVICE_ID",
            BodyKey::InputData => "USER_INPUT_DATA",
            BodyKey::OutputData => "USER_OUTPUT_DATA",
            BodyKey::InitialContent => "INITIAL_CARD_CONTENT",
            BodyKey::InitialContentTag => "INITIAL_CARD_CONTENT_CLASS_NAME",
            BodyKey::IsReaderObservable => "IS_READER_OBSERVABLE",
            BodyKey::ReaderEvent => "READER_EVENT",
            BodyKey::CoreApiLevel => "CORE_API_LEVEL",
            BodyKey::Strategy => "STRATEGY",
            BodyKey::Duration => "DURATION",
        }
    }

    /// Reads this field from `body` under the scheme selected by
    /// `api_level`. A zero level (absent `apiLevel` on the wire) selects the
    /// legacy names.
    pub fn get(self, body: &serde_json::Value, api_level: i32) -> Option<&serde_json::Value> {
        if api_level != 0 {
            body.get(self.key())
        } else {
            body.get(self.legacy())
        }
    }
}
