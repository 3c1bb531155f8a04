//! # relay-core
//!
//! Broadcast engine for the Relay fan-out server.
//!
//! This crate provides the building blocks every transport binding uses:
//!
//! - **IdGenerator** - process-unique, roughly time-sortable ids
//! - **Envelope** - one broadcast unit: id, creation time and payload
//! - **BroadcastRegistry** - live subscriber queues and non-blocking fan-out
//! - **DeliverySession** - one subscriber connection from hello to cleanup
//! - **Keepalive** - jittered background pings
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  publish  ┌───────────────────┐  queue  ┌─────────────────┐
//! │  Publisher  │──────────▶│ BroadcastRegistry │────────▶│ DeliverySession │──▶ sink
//! └─────────────┘           └───────────────────┘         └─────────────────┘
//!                                     ▲
//!                           ┌─────────┴─────────┐
//!                           │     Keepalive     │
//!                           └───────────────────┘
//! ```

pub mod envelope;
pub mod id;
pub mod keepalive;
pub mod registry;
pub mod session;

pub use envelope::{Envelope, FileChunk, Payload, Ping, SystemNotice, Text};
pub use id::IdGenerator;
pub use keepalive::{Keepalive, KeepaliveConfig};
pub use registry::{
    BroadcastRegistry, RegistryConfig, RegistryStats, SubscriberId, Subscription,
    UnsubscribeHandle,
};
pub use session::{
    DeliverySession, EnvelopeSink, LineEncoder, LineSink, SessionEnd, SessionState, SinkError,
};
