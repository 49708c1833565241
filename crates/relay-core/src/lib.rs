//! # relay-core
//!
//! Request handling for the chat relay.
//!
//! - **Dispatcher** - decodes a request, runs its handler, encodes the reply
//! - **Logs** - one append-only NDJSON record log per entity type
//! - **Publisher** - best-effort fan-out of records to broadcast topics
//! - **TopicHub** - in-process broadcast transport for subscriber connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Request   │────▶│ Dispatcher  │────▶│    Logs     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Publisher  │────▶│  TopicHub   │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod clock;
pub mod command;
pub mod dispatcher;
pub mod fanout;
pub mod hub;
pub mod log;
pub mod record;
pub mod store;
pub mod topic;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Command, Service};
pub use dispatcher::{Dispatcher, FailureKind, Outcome, RelayError};
pub use fanout::{Broadcaster, FanoutError, Publisher};
pub use hub::{HubConfig, HubError, TopicHub};
pub use log::{Logs, RecordLog};
pub use record::{ChannelRecord, DirectMessageRecord, Entity, LoginRecord, PublicationRecord};
pub use store::{FileStore, LogStore, MemoryStore, StoreError};
pub use topic::Delivery;
