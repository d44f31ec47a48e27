//! Payload codecs.
//!
//! The codec is chosen per bus through configuration. Every outgoing
//! envelope records the codec it was written with in its `content-type`
//! property, and receivers decode with whatever the envelope names, so a
//! JSON client can talk to a bincode listener.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::envelope::Envelope;
use crate::domain::error::BusError;

/// Envelope property naming the payload encoding.
pub const CONTENT_TYPE: &str = "content-type";

/// Payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Self-describing JSON (default)
    #[default]
    Json,
    /// Compact binary via bincode
    Bincode,
}

impl Codec {
    pub fn content_type(self) -> &'static str {
        match self {
            Codec::Json => "application/json",
            Codec::Bincode => "application/x-bincode",
        }
    }

    pub fn from_content_type(value: &str) -> Option<Self> {
        match value {
            "application/json" => Some(Codec::Json),
            "application/x-bincode" => Some(Codec::Bincode),
            _ => None,
        }
    }

    /// The codec an envelope was written with, falling back to `self`.
    pub fn for_envelope(self, envelope: &Envelope) -> Self {
        envelope
            .properties
            .get(CONTENT_TYPE)
            .and_then(|value| Self::from_content_type(value))
            .unwrap_or(self)
    }

    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, BusError> {
        match self {
            Codec::Json => serde_json::to_vec(value).map_err(|e| BusError::Codec(e.to_string())),
            Codec::Bincode => bincode::serialize(value).map_err(|e| BusError::Codec(e.to_string())),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, BusError> {
        match self {
            Codec::Json => {
                serde_json::from_slice(bytes).map_err(|e| BusError::Codec(e.to_string()))
            }
            Codec::Bincode => {
                bincode::deserialize(bytes).map_err(|e| BusError::Codec(e.to_string()))
            }
        }
    }

    /// Encode a payload into a fresh envelope tagged with `type_tag`.
    pub fn envelope<T: Serialize>(self, type_tag: &str, value: &T) -> Result<Envelope, BusError> {
        let payload = self.encode(value)?;
        Ok(self.raw_envelope(type_tag, payload))
    }

    /// Wrap an already encoded payload.
    pub fn raw_envelope(self, type_tag: &str, payload: Vec<u8>) -> Envelope {
        Envelope::new(type_tag, payload).with_property(CONTENT_TYPE, self.content_type())
    }
}
