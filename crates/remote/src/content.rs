//! Decoder registry for typed initial-resource-state payloads.
//!
//! The wire carries the initial card content as an opaque JSON value plus a
//! declared type tag. The application registers a decoder per tag; a
//! payload with an unregistered tag is a decode error, never a silent
//! `None`.

use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;

#[derive(thiserror::Error, Debug)]
pub enum ContentError {
    #[error("no decoder registered for content tag [{0}]")]
    UnknownTag(String),
    #[error("failed to decode content tagged [{tag}]: {source}")]
    Decode {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

type Decoder = Box<
    dyn Fn(&serde_json::Value) -> Result<Box<dyn Any + Send>, serde_json::Error> + Send + Sync,
>;

/// Maps a declared type tag to its decoding function.
#[derive(Default)]
pub struct ContentRegistry {
    decoders: HashMap<String, Decoder>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` as the decoded form of payloads tagged `tag`.
    pub fn register<T>(&mut self, tag: impl Into<String>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.decoders.insert(
            tag.into(),
            Box::new(|value| {
                serde_json::from_value::<T>(value.clone()).map(|v| Box::new(v) as Box<dyn Any + Send>)
            }),
        );
    }

    pub fn decode(
        &self,
        tag: &str,
        value: &serde_json::Value,
    ) -> Result<Box<dyn Any + Send>, ContentError> {
        let decoder = self
            .decoders
            .get(tag)
            .ok_or_else(|| ContentError::UnknownTag(tag.to_string()))?;
        decoder(value).map_err(|source| ContentError::Decode {
            tag: tag.to_string(),
            source,
        })
    }
}
