//! # relay-server
//!
//! The chat relay process.
//!
//! - a TCP request listener: length-prefixed MessagePack envelopes, one reply
//!   per request, all handled by a single dispatcher worker
//! - a WebSocket subscriber endpoint at `/ws`: clients subscribe to channel
//!   and user topics and receive every record fanned out to them
//! - `/health` and an optional Prometheus exporter

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod worker;

pub use config::Config;
pub use handlers::{run_server, Server};
pub use worker::{RequestQueue, WorkerStopped};
