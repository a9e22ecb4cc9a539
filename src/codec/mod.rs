//! Codec module - serialization of envelopes and frames for the wire.
//!
//! - [`JsonCodec`] - JSON text, what a script-hosted runner posts and expects
//! - [`MsgPackCodec`] - MessagePack via `rmp-serde` for binary-capable channels
//!
//! [`WireFormat`] picks one of them at runtime from the bridge config.
//!
//! # Example
//!
//! ```
//! use runner_bridge::codec::WireFormat;
//!
//! let bytes = WireFormat::Json.encode(&serde_json::json!({"id": "0"})).unwrap();
//! let value: serde_json::Value = WireFormat::Json.decode(&bytes).unwrap();
//! assert_eq!(value["id"], "0");
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Encoding used on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// UTF-8 JSON text.
    #[default]
    Json,
    /// MessagePack, struct-as-map.
    MsgPack,
}

impl WireFormat {
    /// Encode a value in this format.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            WireFormat::Json => JsonCodec::encode(value),
            WireFormat::MsgPack => MsgPackCodec::encode(value),
        }
    }

    /// Decode a value in this format.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            WireFormat::Json => JsonCodec::decode(bytes),
            WireFormat::MsgPack => MsgPackCodec::decode(bytes),
        }
    }
}
