//! Outbound envelopes and inbound response frames.
//!
//! ```text
//! UI  ──► { "id", "message", "request", "origin"? }                 ──► runner
//! UI  ◄── { "id", "response"? | "subscription"? | "error"? }        ◄── runner
//! ```
//!
//! Three ids are reserved for runner telemetry and never correlate with a
//! call: [`STATUS_FRAME_ID`], [`RUNNER_INFO_ID`] and [`CONSOLE_FRAME_ID`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::WireFormat;
use crate::error::Result;

/// Status telemetry: pings out, pongs and status transitions in.
pub const STATUS_FRAME_ID: &str = "0";
/// Runner environment info, sent once after load.
pub const RUNNER_INFO_ID: &str = "-1";
/// Runner console output forwarded to the host.
pub const CONSOLE_FRAME_ID: &str = "-2";

/// Method name of the liveness probe.
pub const PING_MESSAGE: &str = "ping";

/// Whether an id belongs to runner telemetry.
pub fn is_reserved_id(id: &str) -> bool {
    matches!(id, STATUS_FRAME_ID | RUNNER_INFO_ID | CONSOLE_FRAME_ID)
}

/// A call as it goes out to the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id.
    pub id: String,
    /// Method name.
    pub message: String,
    /// Opaque payload.
    pub request: Value,
    /// Origin of the call; absent for calls the wallet makes itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Envelope {
    /// Create an envelope for a wallet-originated call.
    pub fn new(id: impl Into<String>, message: impl Into<String>, request: Value) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            request,
            origin: None,
        }
    }

    /// The liveness probe. Bypasses correlation entirely.
    pub fn ping() -> Self {
        Self::new(STATUS_FRAME_ID, PING_MESSAGE, Value::Object(Default::default()))
    }

    /// Encode for the transport.
    pub fn encode(&self, format: WireFormat) -> Result<Bytes> {
        format.encode(self).map(Bytes::from)
    }
}

/// Result carried by an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// One-shot result.
    Response(Value),
    /// Push update for a subscription.
    Subscription(Value),
    /// Runner-reported failure.
    Error(String),
    /// Frame carried none of the three fields.
    Empty,
}

impl FrameBody {
    /// Whether any of `response`, `subscription` or `error` was present.
    pub fn is_populated(&self) -> bool {
        !matches!(self, FrameBody::Empty)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    /// Correlation id (or a reserved telemetry id).
    pub id: String,
    /// Payload.
    pub body: FrameBody,
}

/// Wire shape of an inbound frame before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawFrame {
    id: String,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    response: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    subscription: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Keeps an explicit `null` distinct from an absent field.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl From<RawFrame> for ResponseFrame {
    fn from(raw: RawFrame) -> Self {
        let populated =
            raw.subscription.is_some() || raw.error.is_some() || raw.response.is_some();

        // A subscription or error only counts when truthy; anything else
        // falls through to the response, null if absent.
        let body = match (raw.subscription, raw.error) {
            (Some(sub), _) if truthy(&sub) => FrameBody::Subscription(sub),
            (_, Some(err)) if !err.is_empty() => FrameBody::Error(err),
            _ if populated => FrameBody::Response(raw.response.unwrap_or(Value::Null)),
            _ => FrameBody::Empty,
        };
        ResponseFrame { id: raw.id, body }
    }
}

/// JSON truthiness: `null`, `false`, `0` and `""` are falsy.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl From<&ResponseFrame> for RawFrame {
    fn from(frame: &ResponseFrame) -> Self {
        let mut raw = RawFrame {
            id: frame.id.clone(),
            ..Default::default()
        };
        match &frame.body {
            FrameBody::Response(v) => raw.response = Some(v.clone()),
            FrameBody::Subscription(v) => raw.subscription = Some(v.clone()),
            FrameBody::Error(e) => raw.error = Some(e.clone()),
            FrameBody::Empty => {}
        }
        raw
    }
}

impl ResponseFrame {
    /// Successful response.
    pub fn response(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            body: FrameBody::Response(value),
        }
    }

    /// Subscription update.
    pub fn subscription(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            body: FrameBody::Subscription(value),
        }
    }

    /// Runner error.
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: FrameBody::Error(message.into()),
        }
    }

    /// Decode an inbound frame.
    pub fn decode(bytes: &[u8], format: WireFormat) -> Result<Self> {
        let raw: RawFrame = format.decode(bytes)?;
        Ok(raw.into())
    }

    /// Encode in wire shape. The runner side of the channel uses this; so do tests.
    pub fn encode(&self, format: WireFormat) -> Result<Bytes> {
        format.encode(&RawFrame::from(self)).map(Bytes::from)
    }

    /// Whether the frame uses a reserved telemetry id.
    pub fn is_reserved(&self) -> bool {
        is_reserved_id(&self.id)
    }
}
