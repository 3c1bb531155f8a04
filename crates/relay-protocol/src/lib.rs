//! # relay-protocol
//!
//! Wire format definitions for the Relay broadcast engine.
//!
//! Subscribers receive a stream of JSON objects, one per line
//! (`application/jsonl`). Every object carries all four payload slots;
//! exactly one of them is marked `present` in normal traffic.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, TextMessage, WireMessage};
//!
//! let mut msg = WireMessage::new("6700F1A2.1", "2024-06-17T10:00:00Z");
//! msg.text = TextMessage::new("alice", "hi");
//!
//! let line = codec::encode(&msg).unwrap();
//! assert!(line.ends_with(b"\n"));
//!
//! let decoded = codec::decode(&line).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod codec;
pub mod wire;

pub use codec::{decode, encode, ProtocolError};
pub use wire::{FileMessage, PingMessage, SystemMessage, TextMessage, WireMessage};

/// Content type of the subscriber stream.
pub const STREAM_CONTENT_TYPE: &str = "application/jsonl";

/// Response header carrying the id assigned to a published message.
pub const MESSAGE_ID_HEADER: &str = "Relay-Message-Id";

/// Id of the synthetic envelope that opens every subscriber stream.
pub const HELLO_ID: &str = "SERVER-HELLO";
