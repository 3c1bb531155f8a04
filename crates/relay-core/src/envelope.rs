//! Envelope types broadcast through the registry.
//!
//! An envelope is one unit of broadcast content plus its identity and
//! creation time. The core never looks inside payloads; file chunk fields
//! are passed through untouched.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use relay_protocol::{
    FileMessage, PingMessage, SystemMessage, TextMessage, WireMessage, HELLO_ID,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::id::IdGenerator;

/// A chat text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    pub sender: String,
    pub body: String,
}

/// One chunk of a file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub sender: String,
    pub client_uuid: String,
    pub filename: String,
    pub mimetype: String,
    pub sha256: String,
    /// Encoded chunk data, opaque to the relay.
    pub data: String,
    pub total_size: u64,
    pub offset: u64,
}

/// Keepalive padding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ping {
    pub nonce: Bytes,
}

/// Server-originated notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemNotice {
    pub text: String,
}

/// Envelope content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Metadata only.
    Empty,
    Text(Text),
    File(FileChunk),
    Ping(Ping),
    System(SystemNotice),
}

impl Payload {
    /// Every value [`Payload::kind`] can return, in declaration order.
    pub const KINDS: [&'static str; 5] = ["empty", "text", "file", "ping", "system"];

    /// Create a text payload.
    #[must_use]
    pub fn text(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Payload::Text(Text {
            sender: sender.into(),
            body: body.into(),
        })
    }

    /// Create a system notice payload.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Payload::System(SystemNotice { text: text.into() })
    }

    /// Create a ping payload.
    #[must_use]
    pub fn ping(nonce: impl Into<Bytes>) -> Self {
        Payload::Ping(Ping {
            nonce: nonce.into(),
        })
    }

    /// Short name of the variant, used in logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        Self::KINDS[self.kind_index()]
    }

    /// Position of this variant's name in [`Payload::KINDS`].
    #[must_use]
    pub fn kind_index(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Text(_) => 1,
            Payload::File(_) => 2,
            Payload::Ping(_) => 3,
            Payload::System(_) => 4,
        }
    }
}

/// An identity-stamped broadcast unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    id: String,
    created_at: OffsetDateTime,
    payload: Payload,
}

impl Envelope {
    /// Create an envelope with a fresh id from `ids`.
    #[must_use]
    pub fn new(ids: &IdGenerator, payload: Payload) -> Self {
        Self::with_id(ids.next_id(), payload)
    }

    /// Create an envelope with a caller-chosen id.
    #[must_use]
    pub fn with_id(id: impl Into<String>, payload: Payload) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            created_at: now.replace_nanosecond(0).unwrap_or(now),
            payload,
        }
    }

    /// The stream-opening envelope sent to every new subscriber.
    #[must_use]
    pub fn hello() -> Self {
        Self::with_id(HELLO_ID, Payload::ping(Bytes::new()))
    }

    /// Get the envelope id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the creation time, truncated to whole seconds.
    #[must_use]
    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    /// Get the payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Get the payload kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Check if this is the stream-opening hello.
    #[must_use]
    pub fn is_hello(&self) -> bool {
        self.id == HELLO_ID
    }

    /// Creation time as RFC 3339.
    #[must_use]
    pub fn time_rfc3339(&self) -> String {
        self.created_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.created_at.unix_timestamp().to_string())
    }
}

impl From<&Envelope> for WireMessage {
    fn from(envelope: &Envelope) -> Self {
        let mut msg = WireMessage::new(envelope.id.clone(), envelope.time_rfc3339());
        match &envelope.payload {
            Payload::Empty => {}
            Payload::Text(text) => {
                msg.text = TextMessage::new(text.sender.clone(), text.body.clone());
            }
            Payload::File(file) => {
                msg.file = FileMessage {
                    present: true,
                    sender: file.sender.clone(),
                    client_uuid: file.client_uuid.clone(),
                    filename: file.filename.clone(),
                    mimetype: file.mimetype.clone(),
                    hash_sha256: file.sha256.clone(),
                    data_b64: file.data.clone(),
                    total_size: file.total_size,
                    offset: file.offset,
                };
            }
            Payload::Ping(ping) => {
                msg.ping = PingMessage {
                    present: true,
                    random: BASE64_STANDARD.encode(&ping.nonce),
                };
            }
            Payload::System(notice) => {
                msg.system = SystemMessage {
                    present: true,
                    text: notice.text.clone(),
                };
            }
        }
        msg
    }
}

impl From<FileMessage> for FileChunk {
    fn from(msg: FileMessage) -> Self {
        Self {
            sender: msg.sender,
            client_uuid: msg.client_uuid,
            filename: msg.filename,
            mimetype: msg.mimetype,
            sha256: msg.hash_sha256,
            data: msg.data_b64,
            total_size: msg.total_size,
            offset: msg.offset,
        }
    }
}
