//! In-process topic hub.
//!
//! The hub is the broadcast transport the fan-out publisher writes to.
//! Subscriber connections register interest in topics and each gets a
//! receiver per topic. Publishing never blocks and never fails: a topic
//! nobody listens to simply drops the record.

use crate::topic::{validate_topic, Delivery, Topic};
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Topic subscription errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Invalid topic name.
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    /// Not subscribed to topic.
    #[error("Not subscribed to topic: {0}")]
    NotSubscribed(String),

    /// Already subscribed to topic.
    #[error("Already subscribed to topic: {0}")]
    AlreadySubscribed(String),

    /// Maximum subscriptions reached for this connection.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Maximum number of live topics reached.
    #[error("Maximum topics reached")]
    MaxTopicsReached,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of live topics.
    pub max_topics: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
    /// Broadcast capacity per topic.
    pub topic_capacity: usize,
    /// Whether to drop topics once their last subscriber leaves.
    pub auto_delete_empty_topics: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_topics: 10_000,
            max_subscriptions_per_connection: 100,
            topic_capacity: 1024,
            auto_delete_empty_topics: true,
        }
    }
}

/// Routes fanned-out records to subscriber connections.
pub struct TopicHub {
    /// Live topics indexed by name.
    topics: DashMap<String, Topic>,
    /// Connection subscriptions (connection_id -> set of topic names).
    subscriptions: DashMap<String, DashSet<String>>,
    config: HubConfig,
}

impl TopicHub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating topic hub with config: {:?}", config);
        Self {
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            config,
        }
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            topic_count: self.topics.len(),
            connection_count: self.subscriptions.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }

    /// Subscribe a connection to a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid, the connection is
    /// already subscribed, or a limit is exceeded.
    pub fn subscribe(
        &self,
        connection_id: &str,
        topic_name: &str,
    ) -> Result<broadcast::Receiver<Arc<Delivery>>, HubError> {
        validate_topic(topic_name).map_err(HubError::InvalidTopic)?;

        let current = match self.subscriptions.get(connection_id) {
            Some(subs) if subs.contains(topic_name) => {
                return Err(HubError::AlreadySubscribed(topic_name.to_string()));
            }
            Some(subs) => subs.len(),
            None => 0,
        };

        if current >= self.config.max_subscriptions_per_connection {
            return Err(HubError::MaxSubscriptionsReached);
        }

        if !self.topics.contains_key(topic_name) && self.topics.len() >= self.config.max_topics {
            return Err(HubError::MaxTopicsReached);
        }

        let mut topic = self
            .topics
            .entry(topic_name.to_string())
            .or_insert_with(|| {
                debug!(topic = %topic_name, "Creating topic");
                Topic::with_capacity(topic_name, self.config.topic_capacity)
            });

        let receiver = topic.subscribe(connection_id);
        self.subscriptions
            .entry(connection_id.to_string())
            .or_default()
            .insert(topic_name.to_string());

        debug!(
            topic = %topic_name,
            connection = %connection_id,
            subscribers = topic.subscriber_count(),
            "Subscribed"
        );

        Ok(receiver)
    }

    /// Unsubscribe a connection from a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not subscribed.
    pub fn unsubscribe(&self, connection_id: &str, topic_name: &str) -> Result<(), HubError> {
        let removed = self
            .subscriptions
            .get(connection_id)
            .and_then(|subs| subs.remove(topic_name));
        if removed.is_none() {
            return Err(HubError::NotSubscribed(topic_name.to_string()));
        }

        self.leave_topic(connection_id, topic_name);
        Ok(())
    }

    /// Unsubscribe a connection from every topic.
    pub fn unsubscribe_all(&self, connection_id: &str) {
        if let Some((_, topics)) = self.subscriptions.remove(connection_id) {
            for topic_name in topics.iter() {
                self.leave_topic(connection_id, topic_name.as_str());
            }
        }

        debug!(connection = %connection_id, "Unsubscribed from all topics");
    }

    fn leave_topic(&self, connection_id: &str, topic_name: &str) {
        let Some(mut topic) = self.topics.get_mut(topic_name) else {
            return;
        };

        topic.unsubscribe(connection_id);

        if self.config.auto_delete_empty_topics && topic.is_empty() {
            drop(topic);
            self.topics.remove_if(topic_name, |_, t| t.is_empty());
            debug!(topic = %topic_name, "Deleted empty topic");
        }
    }

    /// Publish a payload to a topic.
    ///
    /// Returns the number of receivers.
    pub fn publish(&self, topic_name: &str, payload: Bytes) -> usize {
        match self.topics.get(topic_name) {
            Some(topic) => {
                let count = topic.publish(payload);
                trace!(topic = %topic_name, recipients = count, "Published record");
                count
            }
            None => {
                trace!(topic = %topic_name, "No subscribers for topic");
                0
            }
        }
    }

    /// Get the subscriber count for a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic_name: &str) -> usize {
        self.topics
            .get(topic_name)
            .map(|t| t.subscriber_count())
            .unwrap_or(0)
    }
}

impl Default for TopicHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub statistics.
#[derive(Debug, Clone)]
pub struct HubStats {
    /// Number of live topics.
    pub topic_count: usize,
    /// Number of connections with at least one subscription.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_subscribe_unsubscribe() {
        let hub = TopicHub::new();

        let rx = hub.subscribe("conn-1", "general").unwrap();
        assert_eq!(hub.stats().topic_count, 1);
        assert_eq!(hub.subscriber_count("general"), 1);
        drop(rx);

        hub.unsubscribe("conn-1", "general").unwrap();
        assert_eq!(hub.stats().topic_count, 0);
        assert!(matches!(
            hub.unsubscribe("conn-1", "general"),
            Err(HubError::NotSubscribed(_))
        ));
    }

    #[test]
    fn test_hub_publish() {
        let hub = TopicHub::new();

        let mut rx1 = hub.subscribe("conn-1", "general").unwrap();
        let mut rx2 = hub.subscribe("conn-2", "general").unwrap();
        let mut other = hub.subscribe("conn-3", "random").unwrap();

        assert_eq!(hub.publish("general", Bytes::from_static(b"hi")), 2);

        assert_eq!(rx1.try_recv().unwrap().topic, "general");
        assert!(rx2.try_recv().is_ok());
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_publish_to_unknown_topic() {
        let hub = TopicHub::new();
        assert_eq!(hub.publish("nobody", Bytes::from_static(b"hi")), 0);
    }

    #[test]
    fn test_hub_invalid_topic() {
        let hub = TopicHub::new();
        assert!(matches!(
            hub.subscribe("conn-1", ""),
            Err(HubError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_hub_already_subscribed() {
        let hub = TopicHub::new();

        let _rx = hub.subscribe("conn-1", "alice").unwrap();
        assert!(matches!(
            hub.subscribe("conn-1", "alice"),
            Err(HubError::AlreadySubscribed(_))
        ));
    }

    #[test]
    fn test_hub_limits() {
        let hub = TopicHub::with_config(HubConfig {
            max_topics: 2,
            max_subscriptions_per_connection: 2,
            ..HubConfig::default()
        });

        let _a = hub.subscribe("conn-1", "a").unwrap();
        let _b = hub.subscribe("conn-1", "b").unwrap();
        assert!(matches!(
            hub.subscribe("conn-1", "c"),
            Err(HubError::MaxSubscriptionsReached)
        ));
        assert!(matches!(
            hub.subscribe("conn-2", "c"),
            Err(HubError::MaxTopicsReached)
        ));
        assert!(hub.subscribe("conn-2", "a").is_ok());
    }

    #[test]
    fn test_rejected_first_subscribe_leaves_no_entry() {
        let hub = TopicHub::with_config(HubConfig {
            max_topics: 1,
            ..HubConfig::default()
        });
        let _a = hub.subscribe("conn-1", "a").unwrap();

        assert!(matches!(
            hub.subscribe("conn-2", "b"),
            Err(HubError::MaxTopicsReached)
        ));
        assert_eq!(hub.stats().connection_count, 1);

        let closed = TopicHub::with_config(HubConfig {
            max_subscriptions_per_connection: 0,
            ..HubConfig::default()
        });
        assert!(matches!(
            closed.subscribe("conn-1", "a"),
            Err(HubError::MaxSubscriptionsReached)
        ));
        let stats = closed.stats();
        assert_eq!((stats.topic_count, stats.connection_count), (0, 0));
    }

    #[test]
    fn test_hub_unsubscribe_all() {
        let hub = TopicHub::new();

        let _rx1 = hub.subscribe("conn-1", "general").unwrap();
        let _rx2 = hub.subscribe("conn-1", "alice").unwrap();
        let _rx3 = hub.subscribe("conn-2", "general").unwrap();

        let stats = hub.stats();
        assert_eq!(stats.topic_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_subscriptions, 3);

        hub.unsubscribe_all("conn-1");
        let stats = hub.stats();
        assert_eq!(stats.topic_count, 1);
        assert_eq!(stats.connection_count, 1);
        assert_eq!(hub.subscriber_count("alice"), 0);
        assert_eq!(hub.subscriber_count("general"), 1);
    }
}
