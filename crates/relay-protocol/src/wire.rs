//! JSON shapes exchanged with publishers and subscribers.
//!
//! Outbound lines always carry every payload slot. Slots that are not in use
//! are serialized with `present: false` and empty fields, so consumers can
//! dispatch on the `present` flags alone.

use serde::{Deserialize, Serialize};

/// A chat text payload.
///
/// Also the request body of the text publish endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextMessage {
    /// Whether this slot carries content.
    pub present: bool,
    /// Display name of the author.
    pub sender: String,
    /// Message body.
    pub text: String,
}

impl TextMessage {
    /// Create a present text slot.
    #[must_use]
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            present: true,
            sender: sender.into(),
            text: text.into(),
        }
    }
}

/// One chunk of a file transfer.
///
/// Also the request body of the file publish endpoint. `offset` and
/// `total_size` let a consumer reassemble multi-chunk transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMessage {
    /// Whether this slot carries content.
    pub present: bool,
    /// Display name of the author.
    pub sender: String,
    /// Client-chosen transfer id shared by all chunks of one file.
    pub client_uuid: String,
    /// Original file name.
    pub filename: String,
    /// MIME type reported by the client.
    pub mimetype: String,
    /// Hex SHA-256 of the whole file, as reported by the client.
    pub hash_sha256: String,
    /// Base64 chunk data.
    pub data_b64: String,
    /// Size of the complete file in bytes.
    pub total_size: u64,
    /// Byte offset of this chunk within the file.
    pub offset: u64,
}

/// Keepalive padding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingMessage {
    /// Whether this slot carries content.
    pub present: bool,
    /// Base64 random padding.
    pub random: String,
}

/// Server-originated notice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemMessage {
    /// Whether this slot carries content.
    pub present: bool,
    /// Notice text.
    pub text: String,
}

/// One line of the subscriber stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireMessage {
    /// Envelope id.
    pub id: String,
    /// RFC 3339 creation time.
    pub time: String,
    /// Text slot.
    pub text: TextMessage,
    /// File chunk slot.
    pub file: FileMessage,
    /// Keepalive slot.
    pub ping: PingMessage,
    /// System notice slot.
    pub system: SystemMessage,
}

impl WireMessage {
    /// Create a message with identity fields set and every slot absent.
    #[must_use]
    pub fn new(id: impl Into<String>, time: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            time: time.into(),
            ..Self::default()
        }
    }

    /// Name of the first present slot, if any.
    #[must_use]
    pub fn kind(&self) -> Option<&'static str> {
        if self.text.present {
            Some("text")
        } else if self.file.present {
            Some("file")
        } else if self.ping.present {
            Some("ping")
        } else if self.system.present {
            Some("system")
        } else {
            None
        }
    }
}
