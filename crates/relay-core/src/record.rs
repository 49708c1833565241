//! Persisted record types.
//!
//! Each entity type has its own log. Records are written once, tagged with a
//! `type` field, and never updated. The same tagged shape is what subscribers
//! receive when a record is fanned out.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A record type stored in its own log.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Value of the `type` field written alongside the record.
    const KIND: &'static str;
}

/// A user logged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRecord {
    #[serde(alias = "username")]
    pub user: String,
    pub timestamp: i64,
    /// Client logical clock, if the client sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<u64>,
}

impl Entity for LoginRecord {
    const KIND: &'static str = "login";
}

/// A channel was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel: String,
    #[serde(alias = "createdAt")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<u64>,
}

impl Entity for ChannelRecord {
    const KIND: &'static str = "channel";
}

/// A message published to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationRecord {
    #[serde(default, alias = "author")]
    pub user: String,
    pub channel: String,
    #[serde(default)]
    pub message: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<u64>,
}

impl Entity for PublicationRecord {
    const KIND: &'static str = "publication";
}

/// A direct message between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessageRecord {
    #[serde(alias = "from")]
    pub src: String,
    #[serde(alias = "to")]
    pub dst: String,
    #[serde(default)]
    pub message: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<u64>,
}

impl Entity for DirectMessageRecord {
    const KIND: &'static str = "dm";
}

/// Serialization view of a record with its `type` tag.
#[derive(Debug, Serialize)]
pub struct Tagged<'a, R> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    record: &'a R,
}

impl<'a, R: Entity> Tagged<'a, R> {
    /// Tag a record with its entity kind.
    #[must_use]
    pub fn new(record: &'a R) -> Self {
        Self {
            kind: R::KIND,
            record,
        }
    }
}
