//! # relay-transport
//!
//! Request/reply transport for the chat relay.
//!
//! Clients talk to the relay over plain TCP. Every request and every reply is
//! one length-prefixed MessagePack envelope, and replies come back in request
//! order on the same connection.
//!
//! ```rust,ignore
//! use relay_transport::{Connection, Transport, TcpTransport};
//!
//! async fn serve(transport: TcpTransport) {
//!     while let Ok(mut conn) = transport.accept().await {
//!         while let Ok(Some(request)) = conn.recv().await {
//!             // Dispatch and reply
//!         }
//!     }
//! }
//! ```

pub mod tcp;
pub mod traits;

pub use tcp::{RequestClient, TcpConfig, TcpConnection, TcpTransport};
pub use traits::{Connection, ConnectionId, Transport, TransportError};
