//! Service catalog and request normalization.
//!
//! A request envelope is turned into a [`Command`] in one step: the service
//! name is resolved against the closed [`Service`] catalog, legacy field names
//! are folded into their canonical names, and required fields are checked.
//!
//! Accepted field names (canonical first, wins when both are present):
//!
//! | Field     | Alias      | Service   |
//! |-----------|------------|-----------|
//! | `user`    | `username` | `login`   |
//! | `user`    | `author`   | `publish` |
//! | `channel` | `name`     | `channel` |
//! | `src`     | `from`     | `message` |
//! | `dst`     | `to`       | `message` |

use crate::dispatcher::RelayError;
use relay_protocol::Data;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

const LOGIN_USER: &[&str] = &["user", "username"];
const PUBLISH_USER: &[&str] = &["user", "author"];
const CHANNEL: &[&str] = &["channel", "name"];
const PUBLISH_CHANNEL: &[&str] = &["channel"];
const SRC: &[&str] = &["src", "from"];
const DST: &[&str] = &["dst", "to"];

/// Services a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Login,
    Users,
    Channel,
    Channels,
    Publish,
    Message,
}

impl Service {
    /// Every service, in catalog order.
    pub const ALL: [Service; 6] = [
        Service::Login,
        Service::Users,
        Service::Channel,
        Service::Channels,
        Service::Publish,
        Service::Message,
    ];

    /// Wire name of the service.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Service::Login => "login",
            Service::Users => "users",
            Service::Channel => "channel",
            Service::Channels => "channels",
            Service::Publish => "publish",
            Service::Message => "message",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|service| service.as_str() == s)
            .ok_or_else(|| RelayError::UnknownService(s.to_string()))
    }
}

/// Values every record-producing command carries over from the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stamp {
    /// Caller-supplied timestamp, if numeric.
    pub timestamp: Option<i64>,
    /// Caller logical clock, if a non-negative integer.
    pub clock: Option<u64>,
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login {
        user: String,
        stamp: Stamp,
    },
    Users,
    Channel {
        channel: String,
        stamp: Stamp,
    },
    Channels,
    Publish {
        channel: String,
        user: String,
        message: String,
        stamp: Stamp,
    },
    Message {
        src: String,
        dst: String,
        message: String,
        stamp: Stamp,
    },
}

impl Command {
    /// Normalize and validate the arguments of a request.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownService`] if the service is not in the
    /// catalog and [`RelayError::Validation`] if a required field is missing.
    pub fn parse(service: &str, data: &Data) -> Result<Self, RelayError> {
        let stamp = Stamp {
            timestamp: timestamp(data),
            clock: clock(data),
        };

        let command = match service.parse::<Service>()? {
            Service::Login => Command::Login {
                user: identifier(data, LOGIN_USER)
                    .ok_or(RelayError::Validation("user obrigatório"))?,
                stamp,
            },
            Service::Users => Command::Users,
            Service::Channel => Command::Channel {
                channel: identifier(data, CHANNEL)
                    .ok_or(RelayError::Validation("channel obrigatório"))?,
                stamp,
            },
            Service::Channels => Command::Channels,
            Service::Publish => Command::Publish {
                channel: identifier(data, PUBLISH_CHANNEL)
                    .ok_or(RelayError::Validation("channel obrigatório"))?,
                user: identifier(data, PUBLISH_USER).unwrap_or_default(),
                message: body(data),
                stamp,
            },
            Service::Message => match (identifier(data, SRC), identifier(data, DST)) {
                (Some(src), Some(dst)) => Command::Message {
                    src,
                    dst,
                    message: body(data),
                    stamp,
                },
                _ => return Err(RelayError::Validation("src e dst obrigatórios")),
            },
        };

        Ok(command)
    }

    /// The service this command belongs to.
    #[must_use]
    pub fn service(&self) -> Service {
        match self {
            Command::Login { .. } => Service::Login,
            Command::Users => Service::Users,
            Command::Channel { .. } => Service::Channel,
            Command::Channels => Service::Channels,
            Command::Publish { .. } => Service::Publish,
            Command::Message { .. } => Service::Message,
        }
    }
}

/// Render a scalar as text. Null, arrays and maps count as absent.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// First non-empty trimmed value among a field and its aliases.
fn identifier(data: &Data, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| data.get(*name).and_then(text))
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

/// The message body, kept verbatim.
fn body(data: &Data) -> String {
    data.get("message").and_then(text).unwrap_or_default()
}

fn timestamp(data: &Data) -> Option<i64> {
    let value = data.get("timestamp")?;
    value
        .as_i64()
        .or_else(|| value.as_u64().map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .or_else(|| value.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))
}

fn clock(data: &Data) -> Option<u64> {
    data.get("clock").and_then(Value::as_u64)
}
