//! Frames exchanged with broadcast subscribers.
//!
//! Subscribers never talk to the dispatcher. They open a subscriber
//! connection, subscribe to topics (channel names or user names) and receive
//! every record fanned out to those topics as a [`Frame::Message`].

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Subscribe,
    Unsubscribe,
    Message,
    Ack,
    Error,
    Ping,
    Pong,
}

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The topic name was rejected.
    pub const INVALID_TOPIC: u16 = 1001;
    /// Subscribing failed (limits, duplicate subscription).
    pub const SUBSCRIBE_FAILED: u16 = 1002;
    /// Unsubscribing from a topic the connection is not subscribed to.
    pub const NOT_SUBSCRIBED: u16 = 1008;
    /// The frame is not valid from a subscriber.
    pub const UNEXPECTED_FRAME: u16 = 1010;
}

/// A subscriber protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Subscribe to a topic.
    #[serde(rename = "subscribe")]
    Subscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Topic to subscribe to.
        topic: String,
    },

    /// Unsubscribe from a topic.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Topic to unsubscribe from.
        topic: String,
    },

    /// A record fanned out to a topic.
    #[serde(rename = "message")]
    Message {
        /// Topic the record was published on.
        topic: String,
        /// MessagePack-encoded record.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Acknowledgment of a subscribe or unsubscribe.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Message { .. } => FrameType::Message,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u64, topic: impl Into<String>) -> Self {
        Frame::Subscribe {
            id,
            topic: topic.into(),
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: u64, topic: impl Into<String>) -> Self {
        Frame::Unsubscribe {
            id,
            topic: topic.into(),
        }
    }

    /// Create a new Message frame.
    #[must_use]
    pub fn message(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Message {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}
