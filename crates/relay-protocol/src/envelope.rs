//! Request and reply envelopes.
//!
//! Every message on the request/reply channel is a MessagePack map with two
//! keys: `service` names the operation and `data` carries its arguments (or,
//! in a reply, its results). Decoding is lenient about the shape of the map so
//! the dispatcher can always answer with an error reply instead of dropping the
//! request.
//!
//! Decoding goes through [`rmpv::Value`] so any MessagePack map is accepted,
//! not only JSON-shaped ones. Entries under non-string keys are skipped.
//! `bin` values become arrays of byte values, timestamp extensions (type -1)
//! become epoch milliseconds and other extension values are dropped.

use bytes::Bytes;
use rmpv::Value as Packed;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Arguments or results carried by an envelope.
pub type Data = Map<String, Value>;

/// `data.status` of a successful reply.
pub const STATUS_OK: &str = "ok";

/// `data.status` of a failed reply.
pub const STATUS_ERROR: &str = "erro";

/// Pseudo-service used for every error reply. Never valid in a request.
pub const ERROR_SERVICE: &str = "error";

/// Message carried by the reply to undecodable request bytes.
pub const DECODE_ERROR_MESSAGE: &str = "msgpack inválido";

/// Envelope encoding and decoding errors.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The bytes are not valid MessagePack.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    /// The bytes decode, but not to a map.
    #[error("Envelope is not a map")]
    NotAMap,
}

/// A request as sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Requested service. Empty when the client omitted it.
    #[serde(default)]
    pub service: String,
    /// Service arguments.
    #[serde(default)]
    pub data: Data,
}

impl RequestEnvelope {
    /// Create a request with no arguments.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            data: Data::new(),
        }
    }

    /// Add an argument.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// A reply produced by the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Echoed service name, or [`ERROR_SERVICE`].
    #[serde(default)]
    pub service: String,
    /// Reply fields. Always includes `status`.
    #[serde(default)]
    pub data: Data,
}

impl ReplyEnvelope {
    /// Create the default successful reply for a service.
    #[must_use]
    pub fn ok(service: impl Into<String>, timestamp: i64) -> Self {
        let mut data = Data::new();
        data.insert("status".into(), STATUS_OK.into());
        data.insert("timestamp".into(), timestamp.into());
        Self {
            service: service.into(),
            data,
        }
    }

    /// Create an error reply.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert("status".into(), STATUS_ERROR.into());
        data.insert("message".into(), Value::String(message.into()));
        Self {
            service: ERROR_SERVICE.to_string(),
            data,
        }
    }

    /// Set a reply field, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Get a reply field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The `status` field, if it is a string.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.data.get("status").and_then(Value::as_str)
    }

    /// Whether this is an error reply.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.service == ERROR_SERVICE || self.status() == Some(STATUS_ERROR)
    }
}

/// Encode an envelope to MessagePack.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Bytes, EnvelopeError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(envelope)?))
}

/// Decode a request envelope.
///
/// Any MessagePack map is accepted. A scalar `service` is rendered as text, a
/// missing or non-scalar one becomes the empty string, and a missing or
/// non-map `data` becomes an empty map.
///
/// # Errors
///
/// Returns an error if the bytes are not MessagePack or not a map.
pub fn decode_request(bytes: &[u8]) -> Result<RequestEnvelope, EnvelopeError> {
    let (service, data) = decode_parts(bytes)?;
    Ok(RequestEnvelope { service, data })
}

/// Decode a reply envelope, with the same leniency as [`decode_request`].
///
/// # Errors
///
/// Returns an error if the bytes are not MessagePack or not a map.
pub fn decode_reply(bytes: &[u8]) -> Result<ReplyEnvelope, EnvelopeError> {
    let (service, data) = decode_parts(bytes)?;
    Ok(ReplyEnvelope { service, data })
}

fn decode_parts(bytes: &[u8]) -> Result<(String, Data), EnvelopeError> {
    let Packed::Map(entries) = rmpv::decode::read_value(&mut &bytes[..])? else {
        return Err(EnvelopeError::NotAMap);
    };

    let mut service = String::new();
    let mut data = Data::new();
    for (key, value) in entries {
        match key.as_str() {
            Some("service") => service = scalar_text(&value),
            Some("data") => {
                data = match value {
                    Packed::Map(fields) => to_data(fields),
                    _ => Data::new(),
                };
            }
            _ => {}
        }
    }

    Ok((service, data))
}

fn scalar_text(value: &Packed) -> String {
    match value {
        Packed::String(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        Packed::Integer(n) => n.to_string(),
        Packed::F32(f) => f.to_string(),
        Packed::F64(f) => f.to_string(),
        Packed::Boolean(b) => b.to_string(),
        _ => String::new(),
    }
}

fn to_data(entries: Vec<(Packed, Packed)>) -> Data {
    entries
        .into_iter()
        .filter_map(|(key, value)| {
            let key = key.as_str()?.to_string();
            Some((key, to_json(value)?))
        })
        .collect()
}

fn to_json(value: Packed) -> Option<Value> {
    let json = match value {
        Packed::Nil => Value::Null,
        Packed::Boolean(b) => Value::Bool(b),
        Packed::Integer(n) => match n.as_i64() {
            Some(n) => n.into(),
            None => n.as_u64()?.into(),
        },
        Packed::F32(f) => float(f64::from(f)),
        Packed::F64(f) => float(f),
        Packed::String(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        Packed::Binary(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
        Packed::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| to_json(item).unwrap_or(Value::Null))
                .collect(),
        ),
        Packed::Map(entries) => Value::Object(to_data(entries)),
        Packed::Ext(TIMESTAMP_EXT, raw) => timestamp_millis(&raw)?.into(),
        Packed::Ext(..) => return None,
    };
    Some(json)
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

/// MessagePack timestamp extension type.
const TIMESTAMP_EXT: i8 = -1;

/// Epoch milliseconds of a timestamp extension payload (32, 64 or 96 bit).
fn timestamp_millis(raw: &[u8]) -> Option<i64> {
    const NANOS_PER_MILLI: u32 = 1_000_000;

    let (secs, nanos) = match raw.len() {
        4 => (i64::from(u32::from_be_bytes(raw.try_into().ok()?)), 0),
        8 => {
            let packed = u64::from_be_bytes(raw.try_into().ok()?);
            let nanos = u32::try_from(packed >> 34).ok()?;
            (i64::try_from(packed & 0x3_ffff_ffff).ok()?, nanos)
        }
        12 => {
            let nanos = u32::from_be_bytes(raw[..4].try_into().ok()?);
            (i64::from_be_bytes(raw[4..].try_into().ok()?), nanos)
        }
        _ => return None,
    };

    secs.checked_mul(1000)?
        .checked_add(i64::from(nanos / NANOS_PER_MILLI))
}
