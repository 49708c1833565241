//! Broadcast topics.
//!
//! A topic is a channel name or a user name. Subscribers of a topic receive
//! every record fanned out to it while they are subscribed; there is no
//! history for late subscribers.

use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Maximum topic name length in bytes.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Default broadcast capacity per topic.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_LENGTH {
        return Err("Topic name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Topic name contains control characters");
    }
    Ok(())
}

/// A record on its way to the subscribers of a topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the record was published on.
    pub topic: String,
    /// MessagePack-encoded record.
    pub payload: Bytes,
}

/// A topic with its current subscribers.
#[derive(Debug)]
pub struct Topic {
    name: String,
    sender: broadcast::Sender<Arc<Delivery>>,
    subscribers: HashSet<String>,
}

impl Topic {
    /// Create a new topic.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a new topic with a specific broadcast capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
            subscribers: HashSet::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Subscribe a connection, returning its receiver.
    pub fn subscribe(
        &mut self,
        connection_id: impl Into<String>,
    ) -> broadcast::Receiver<Arc<Delivery>> {
        let conn_id = connection_id.into();
        debug!(topic = %self.name, connection = %conn_id, "Connection subscribed");
        self.subscribers.insert(conn_id);
        self.sender.subscribe()
    }

    /// Unsubscribe a connection.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&mut self, connection_id: &str) -> bool {
        let removed = self.subscribers.remove(connection_id);
        if removed {
            debug!(topic = %self.name, connection = %connection_id, "Connection unsubscribed");
        }
        removed
    }

    /// Send a payload to every current receiver.
    ///
    /// Returns the number of receivers.
    pub fn publish(&self, payload: Bytes) -> usize {
        let delivery = Arc::new(Delivery {
            topic: self.name.clone(),
            payload,
        });
        trace!(topic = %self.name, "Publishing record");
        self.sender.send(delivery).unwrap_or_default()
    }
}
