//! Uniform encode/decode over JSON and MessagePack, plus the wire shapes.
//!
//! Every boundary value (HTTP bodies, catalog responses, socket frames)
//! flows through [`Codec`]. Call arguments are carried as [`RawValue`] so the
//! dispatcher can defer per-argument decoding until the parameter type is
//! known.

use axum::extract::ws::Message;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{CallError, CodecError};

/// Wire encoding of a server. Chosen once per server; frames are text for
/// JSON and binary for MessagePack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Codec {
    #[default]
    Json,
    MessagePack,
}

impl Codec {
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }

    pub const fn content_type(self) -> &'static str {
        match self {
            Codec::Json => "application/json",
            Codec::MessagePack => "application/msgpack",
        }
    }

    pub const fn binary_frames(self) -> bool {
        matches!(self, Codec::MessagePack)
    }
}

/// A not-yet-decoded wire value in the codec's own value model.
///
/// Held per argument until the dispatcher knows the target parameter type,
/// then consumed by [`RawValue::decode_into`].
#[derive(Clone, Debug)]
pub enum RawValue {
    Json(serde_json::Value),
    Pack(rmpv::Value),
}

impl RawValue {
    pub fn null(codec: Codec) -> Self {
        match codec {
            Codec::Json => RawValue::Json(serde_json::Value::Null),
            Codec::MessagePack => RawValue::Pack(rmpv::Value::Nil),
        }
    }

    /// Decode into a concrete type.
    pub fn decode_into<T: DeserializeOwned>(self) -> Result<T, CodecError> {
        match self {
            RawValue::Json(value) => Ok(serde_json::from_value(value)?),
            RawValue::Pack(value) => Ok(rmpv::ext::from_value(value)?),
        }
    }

    /// Capture a handler result in the codec's value model.
    pub fn from_serialize<T: Serialize>(codec: Codec, value: &T) -> Result<Self, CodecError> {
        match codec {
            Codec::Json => Ok(RawValue::Json(serde_json::to_value(value)?)),
            Codec::MessagePack => Ok(RawValue::Pack(rmpv::ext::to_value(value)?)),
        }
    }
}

impl Serialize for RawValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RawValue::Json(value) => value.serialize(serializer),
            RawValue::Pack(value) => value.serialize(serializer),
        }
    }
}

// ── Calls and responses ─────────────────────────────────────────────────────

/// One call of a batch, after batch decoding but before argument decoding.
#[derive(Clone, Debug)]
pub struct Call {
    pub id: String,
    pub name: String,
    pub args: Vec<RawValue>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "V: serde::Deserialize<'de>"))]
struct WireCall<V> {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    args: Vec<V>,
}

/// Result of one call. In a batch response, entry `i` answers call `i`.
#[derive(Debug, Serialize)]
pub struct Response {
    pub id: String,
    pub data: RawValue,
    pub error: String,
}

impl Response {
    pub(crate) fn data(id: String, data: RawValue) -> Self {
        Self {
            id,
            data,
            error: String::new(),
        }
    }

    pub(crate) fn error(id: String, codec: Codec, err: &CallError) -> Self {
        Self {
            id,
            data: RawValue::null(codec),
            error: err.to_string(),
        }
    }
}

/// Decode an HTTP body or socket `call` body into a batch.
pub(crate) fn decode_batch(codec: Codec, bytes: &[u8]) -> Result<Vec<Call>, CodecError> {
    match codec {
        Codec::Json => {
            let calls: Vec<WireCall<serde_json::Value>> = serde_json::from_slice(bytes)?;
            Ok(calls.into_iter().map(call_from_json).collect())
        }
        Codec::MessagePack => {
            let calls: Vec<WireCall<rmpv::Value>> = rmp_serde::from_slice(bytes)?;
            Ok(calls.into_iter().map(call_from_pack).collect())
        }
    }
}

/// Decode a batch out of an already-parsed envelope body.
pub(crate) fn batch_from_raw(raw: RawValue) -> Result<Vec<Call>, CodecError> {
    match raw {
        RawValue::Json(value) => {
            let calls: Vec<WireCall<serde_json::Value>> = serde_json::from_value(value)?;
            Ok(calls.into_iter().map(call_from_json).collect())
        }
        RawValue::Pack(value) => {
            let calls: Vec<WireCall<rmpv::Value>> = rmpv::ext::from_value(value)?;
            Ok(calls.into_iter().map(call_from_pack).collect())
        }
    }
}

fn call_from_json(call: WireCall<serde_json::Value>) -> Call {
    Call {
        id: call.id,
        name: call.name,
        args: call.args.into_iter().map(RawValue::Json).collect(),
    }
}

fn call_from_pack(call: WireCall<rmpv::Value>) -> Call {
    Call {
        id: call.id,
        name: call.name,
        args: call.args.into_iter().map(RawValue::Pack).collect(),
    }
}

// ── Socket envelopes ────────────────────────────────────────────────────────

/// The closed set of socket frame actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Call,
    Subscribe,
    Unsubscribe,
    Result,
    Event,
    Start,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "V: serde::Deserialize<'de>"))]
struct WireEnvelope<V> {
    action: Action,
    #[serde(default)]
    name: String,
    #[serde(default)]
    body: Option<V>,
}

/// An inbound socket frame after envelope decoding; the body stays raw.
#[derive(Debug)]
pub(crate) struct InboundEnvelope {
    pub action: Action,
    pub name: String,
    pub body: Option<RawValue>,
}

pub(crate) fn decode_envelope(codec: Codec, bytes: &[u8]) -> Result<InboundEnvelope, CodecError> {
    match codec {
        Codec::Json => {
            let envelope: WireEnvelope<serde_json::Value> = serde_json::from_slice(bytes)?;
            Ok(InboundEnvelope {
                action: envelope.action,
                name: envelope.name,
                body: envelope.body.map(RawValue::Json),
            })
        }
        Codec::MessagePack => {
            let envelope: WireEnvelope<rmpv::Value> = rmp_serde::from_slice(bytes)?;
            Ok(InboundEnvelope {
                action: envelope.action,
                name: envelope.name,
                body: envelope.body.map(RawValue::Pack),
            })
        }
    }
}

#[derive(Serialize)]
struct OutEnvelope<'a, T> {
    action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a T>,
}

pub(crate) fn encode_envelope<T: Serialize>(
    codec: Codec,
    action: Action,
    body: &T,
) -> Result<Vec<u8>, CodecError> {
    codec.encode(&OutEnvelope {
        action,
        body: Some(body),
    })
}

/// Wrap encoded bytes in the frame type the codec mandates.
pub(crate) fn frame(codec: Codec, bytes: Vec<u8>) -> Message {
    if codec.binary_frames() {
        Message::Binary(bytes.into())
    } else {
        Message::Text(String::from_utf8_lossy(&bytes).into_owned().into())
    }
}
