//! Serialization of wire headers and typed stub payloads.
//!
//! A codec is passed explicitly to the caller, client and stubs; there is no
//! process-wide serializer configuration.

use crate::error::{CourierError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

pub trait Codec: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>>;

    fn decode_value(&self, bytes: &[u8]) -> Result<Value>;
}

impl dyn Codec {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        self.encode_value(&serde_json::to_value(value)?)
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_value(self.decode_value(bytes)?)?)
    }

    /// Encode for a string message property.
    pub fn encode_text<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        String::from_utf8(self.encode(value)?).map_err(|error| {
            CourierError::Codec(format!(
                "{} codec produced non UTF-8 header: {error}",
                self.name()
            ))
        })
    }

    pub fn decode_text<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        self.decode(text.as_bytes())
    }
}

/// JSON codec, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn default_codec() -> Arc<dyn Codec> {
    Arc::new(JsonCodec)
}
