//! Best-effort fan-out of persisted records.
//!
//! The log is the source of truth. Fan-out only notifies whoever happens to
//! be subscribed right now: there is no acknowledgment and no retry, and a
//! failed send never fails the request that produced the record.

use crate::hub::TopicHub;
use crate::record::{Entity, Tagged};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Fan-out errors. Logged by the publisher, never returned to callers.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Record encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The broadcast transport rejected the send.
    #[error("Broadcast failed: {0}")]
    Transport(String),
}

/// A broadcast transport accepting (topic, payload) pairs.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Send a payload to a topic.
    ///
    /// Returns the number of receivers reached, when the transport knows it.
    async fn broadcast(&self, topic: &str, payload: Bytes) -> Result<usize, FanoutError>;
}

#[async_trait]
impl Broadcaster for TopicHub {
    async fn broadcast(&self, topic: &str, payload: Bytes) -> Result<usize, FanoutError> {
        Ok(self.publish(topic, payload))
    }
}

/// Serializes records and hands them to the broadcast transport.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Broadcaster>,
}

impl Publisher {
    /// Create a publisher over a broadcast transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Broadcaster>) -> Self {
        Self { transport }
    }

    /// Fan a record out to a topic.
    ///
    /// The payload is the MessagePack encoding of the tagged record.
    pub async fn publish<R: Entity>(&self, topic: &str, record: &R) {
        match self.try_publish(topic, record).await {
            Ok(recipients) => {
                debug!(topic = %topic, kind = R::KIND, recipients, "Fanned out record");
            }
            Err(e) => {
                warn!(topic = %topic, kind = R::KIND, error = %e, "Fan-out failed");
            }
        }
    }

    async fn try_publish<R: Entity>(&self, topic: &str, record: &R) -> Result<usize, FanoutError> {
        let payload = rmp_serde::to_vec_named(&Tagged::new(record))?;
        self.transport.broadcast(topic, Bytes::from(payload)).await
    }
}
