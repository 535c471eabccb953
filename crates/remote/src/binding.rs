//! Server-side record of one remote reader bound to a service execution.

use std::any::Any;

use serde::de::DeserializeOwned;

use crate::content::{ContentError, ContentRegistry};
use crate::error::ServiceError;

/// A typed payload plus the tag naming its decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialContent {
    pub tag: String,
    pub value: serde_json::Value,
}

/// Links a generated reader name to the local reader it reflects, the
/// owning session and client node, and the service being executed. Created
/// on `EXECUTE_REMOTE_SERVICE`, destroyed on `END_REMOTE_SERVICE`.
#[derive(Debug)]
pub struct RemoteReaderBinding {
    pub(crate) remote_reader_name: String,
    pub(crate) local_reader_name: Option<String>,
    pub(crate) session_id: String,
    pub(crate) client_node_id: String,
    pub(crate) service_id: String,
    pub(crate) input_data: Option<serde_json::Value>,
    pub(crate) initial_content: Option<InitialContent>,
    pub(crate) observable: bool,
    pub(crate) client_api_level: i32,
    pub(crate) client_core_api_level: i32,
}

impl RemoteReaderBinding {
    /// The generated name addressing this binding.
    pub fn name(&self) -> &str {
        &self.remote_reader_name
    }

    pub fn local_reader_name(&self) -> Option<&str> {
        self.local_reader_name.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_node_id(&self) -> &str {
        &self.client_node_id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn is_observable(&self) -> bool {
        self.observable
    }

    /// Protocol generation of the client that opened this binding; `0` for
    /// a legacy peer.
    pub fn client_api_level(&self) -> i32 {
        self.client_api_level
    }

    /// Core-layer generation of the client; `-1` when unknown, `0` for a
    /// legacy peer.
    pub fn client_core_api_level(&self) -> i32 {
        self.client_core_api_level
    }

    /// The raw input payload, if the client supplied one.
    pub fn input_data(&self) -> Option<&serde_json::Value> {
        self.input_data.as_ref()
    }

    /// Deserializes the input payload. `Ok(None)` when the client supplied
    /// none.
    pub fn input_data_as<T>(&self) -> Result<Option<T>, ServiceError>
    where
        T: DeserializeOwned,
    {
        match &self.input_data {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| ServiceError::MalformedBody(e.to_string())),
        }
    }

    /// The raw initial content, if the client supplied one.
    pub fn initial_content_raw(&self) -> Option<&InitialContent> {
        self.initial_content.as_ref()
    }

    /// Decodes the initial content through the registry. `Ok(None)` when
    /// the client supplied none; an unregistered tag is an error.
    pub fn initial_content(
        &self,
        registry: &ContentRegistry,
    ) -> Result<Option<Box<dyn Any + Send>>, ContentError> {
        match &self.initial_content {
            None => Ok(None),
            Some(content) => registry.decode(&content.tag, &content.value).map(Some),
        }
    }
}
