//! Request dispatcher.
//!
//! The dispatcher turns one request into exactly one reply. It owns the
//! record logs and the fan-out publisher; every failure along the way
//! (undecodable bytes, unknown service, missing field, storage error) becomes
//! an error reply and never escapes to the request loop.
//!
//! The dispatcher does no locking of its own. The `channel` and `publish`
//! handlers check the channel log and then append to it, which is only
//! race-free when a single task drives the dispatcher and handles one
//! request at a time.

use crate::clock::Clock;
use crate::command::{Command, Service, Stamp};
use crate::fanout::Publisher;
use crate::log::Logs;
use crate::record::{ChannelRecord, DirectMessageRecord, LoginRecord, PublicationRecord};
use crate::store::StoreError;
use bytes::Bytes;
use relay_protocol::envelope::{self, DECODE_ERROR_MESSAGE};
use relay_protocol::{ReplyEnvelope, RequestEnvelope};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors raised while handling a request. Each one becomes an error reply
/// whose message is the error's display text.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A required field is missing or empty.
    #[error("{0}")]
    Validation(&'static str),

    /// The service is not in the catalog.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// Appending to or scanning a log failed. The reply omits the log path.
    #[error("storage error: {}", .0.summary())]
    Storage(#[from] StoreError),
}

/// Outcome of a processed request, for logging and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request succeeded.
    Ok(Service),
    /// The request bytes could not be decoded.
    Undecodable,
    /// The request failed.
    Failed(FailureKind),
}

/// Failure classes, matching [`RelayError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    UnknownService,
    Storage,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::UnknownService => "unknown_service",
            FailureKind::Storage => "storage",
        }
    }
}

impl RelayError {
    fn kind(&self) -> FailureKind {
        match self {
            RelayError::Validation(_) => FailureKind::Validation,
            RelayError::UnknownService(_) => FailureKind::UnknownService,
            RelayError::Storage(_) => FailureKind::Storage,
        }
    }
}

/// Routes requests to their handlers.
pub struct Dispatcher {
    logs: Logs,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Create a dispatcher owning its logs.
    #[must_use]
    pub fn new(logs: Logs, publisher: Publisher, clock: Arc<dyn Clock>) -> Self {
        Self {
            logs,
            publisher,
            clock,
        }
    }

    /// The logs this dispatcher writes to.
    #[must_use]
    pub fn logs(&self) -> &Logs {
        &self.logs
    }

    /// Handle raw request bytes, returning the encoded reply.
    pub async fn handle_bytes(&self, request: &[u8]) -> (Bytes, Outcome) {
        let (reply, outcome) = match envelope::decode_request(request) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                warn!(error = %e, bytes = request.len(), "Invalid request envelope");
                (ReplyEnvelope::error(DECODE_ERROR_MESSAGE), Outcome::Undecodable)
            }
        };

        (encode_reply(&reply), outcome)
    }

    /// Handle a decoded request.
    pub async fn dispatch(&self, request: RequestEnvelope) -> (ReplyEnvelope, Outcome) {
        debug!(service = %request.service, "Request");

        match self.route(&request).await {
            Ok((reply, service)) => (reply, Outcome::Ok(service)),
            Err(e) => {
                match &e {
                    RelayError::Storage(source) => {
                        error!(service = %request.service, error = %source, "Storage failure");
                    }
                    _ => warn!(service = %request.service, error = %e, "Request failed"),
                }
                let kind = e.kind();
                (ReplyEnvelope::error(e.to_string()), Outcome::Failed(kind))
            }
        }
    }

    async fn route(
        &self,
        request: &RequestEnvelope,
    ) -> Result<(ReplyEnvelope, Service), RelayError> {
        let command = Command::parse(&request.service, &request.data)?;
        let service = command.service();
        let mut reply = ReplyEnvelope::ok(service.as_str(), self.clock.now_millis());

        match command {
            Command::Login { user, stamp } => self.login(&mut reply, user, stamp).await?,
            Command::Users => self.users(&mut reply).await?,
            Command::Channel { channel, stamp } => {
                self.channel(&mut reply, channel, stamp).await?;
            }
            Command::Channels => self.channels(&mut reply).await?,
            Command::Publish {
                channel,
                user,
                message,
                stamp,
            } => self.publish(&mut reply, channel, user, message, stamp).await?,
            Command::Message {
                src,
                dst,
                message,
                stamp,
            } => self.direct_message(&mut reply, src, dst, message, stamp).await?,
        }

        Ok((reply, service))
    }

    async fn login(
        &self,
        reply: &mut ReplyEnvelope,
        user: String,
        stamp: Stamp,
    ) -> Result<(), RelayError> {
        let record = LoginRecord {
            user,
            timestamp: self.timestamp(stamp),
            clock: stamp.clock,
        };
        self.logs.logins.append(&record).await?;

        reply.insert("message", "Login registrado");
        reply.insert("user", record.user);
        Ok(())
    }

    async fn users(&self, reply: &mut ReplyEnvelope) -> Result<(), RelayError> {
        let users = distinct(self.logs.logins.scan_all().await?.map(|r| r.user));
        reply.insert("users", users);
        Ok(())
    }

    async fn channel(
        &self,
        reply: &mut ReplyEnvelope,
        channel: String,
        stamp: Stamp,
    ) -> Result<(), RelayError> {
        let created = self.ensure_channel(&channel, stamp).await?;

        let message = if created {
            "Canal criado"
        } else {
            "Canal assegurado"
        };
        reply.insert("message", message);
        reply.insert("channel", channel);
        Ok(())
    }

    async fn channels(&self, reply: &mut ReplyEnvelope) -> Result<(), RelayError> {
        let channels = distinct(self.logs.channels.scan_all().await?.map(|r| r.channel));
        reply.insert("channels", channels);
        Ok(())
    }

    async fn publish(
        &self,
        reply: &mut ReplyEnvelope,
        channel: String,
        user: String,
        message: String,
        stamp: Stamp,
    ) -> Result<(), RelayError> {
        self.ensure_channel(&channel, stamp).await?;

        let record = PublicationRecord {
            user,
            channel,
            message,
            timestamp: self.timestamp(stamp),
            clock: stamp.clock,
        };
        self.logs.publications.append(&record).await?;
        self.publisher.publish(&record.channel, &record).await;

        reply.insert("message", "Publicado");
        reply.insert("channel", record.channel);
        Ok(())
    }

    async fn direct_message(
        &self,
        reply: &mut ReplyEnvelope,
        src: String,
        dst: String,
        message: String,
        stamp: Stamp,
    ) -> Result<(), RelayError> {
        let record = DirectMessageRecord {
            src,
            dst,
            message,
            timestamp: self.timestamp(stamp),
            clock: stamp.clock,
        };
        self.logs.direct_messages.append(&record).await?;

        // Recipient first, then the sender's own topic.
        self.publisher.publish(&record.dst, &record).await;
        self.publisher.publish(&record.src, &record).await;

        reply.insert("message", "DM registrada");
        reply.insert("src", record.src);
        reply.insert("dst", record.dst);
        Ok(())
    }

    /// Append a channel record unless one with this name is already logged.
    ///
    /// Returns `true` if the channel was created.
    async fn ensure_channel(&self, channel: &str, stamp: Stamp) -> Result<bool, RelayError> {
        let exists = self
            .logs
            .channels
            .scan_all()
            .await?
            .any(|r| r.channel == channel);

        if exists {
            debug!(channel = %channel, "Channel already exists");
            return Ok(false);
        }

        let record = ChannelRecord {
            channel: channel.to_string(),
            timestamp: self.timestamp(stamp),
            clock: stamp.clock,
        };
        self.logs.channels.append(&record).await?;
        debug!(channel = %channel, "Channel created");
        Ok(true)
    }

    /// Caller timestamp if given, otherwise the clock at handler time.
    fn timestamp(&self, stamp: Stamp) -> i64 {
        stamp.timestamp.unwrap_or_else(|| self.clock.now_millis())
    }
}

/// Deduplicate by value, keeping first-seen order.
fn distinct(values: impl Iterator<Item = String>) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .filter(|v| seen.insert(v.clone()))
        .map(Value::String)
        .collect()
}

fn encode_reply(reply: &ReplyEnvelope) -> Bytes {
    envelope::encode(reply).unwrap_or_else(|e| {
        error!(service = %reply.service, error = %e, "Failed to encode reply");
        envelope::encode(&ReplyEnvelope::error("reply encoding failed")).unwrap_or_default()
    })
}
