//! # relay-protocol
//!
//! Wire formats for the chat relay.
//!
//! - **Envelopes** - `{service, data}` MessagePack maps exchanged on the
//!   request/reply channel
//! - **Frames** - subscribe/unsubscribe/message frames exchanged with
//!   broadcast subscribers
//! - **Codec** - length-prefixed framing used by stream transports
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{envelope, RequestEnvelope};
//!
//! let request = RequestEnvelope::new("login").with("user", "alice");
//!
//! let encoded = envelope::encode(&request).unwrap();
//! let decoded = envelope::decode_request(&encoded).unwrap();
//! assert_eq!(decoded.service, "login");
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;

pub use codec::ProtocolError;
pub use envelope::{Data, EnvelopeError, ReplyEnvelope, RequestEnvelope};
pub use frames::{Frame, FrameType};
