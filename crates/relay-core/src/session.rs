//! Delivery sessions.
//!
//! A session is one subscriber connection: it registers with the registry,
//! writes a hello envelope, then streams its queue to an [`EnvelopeSink`]
//! until the peer goes away. The subscription is released on every exit
//! path, including a panic inside the sink.

use crate::envelope::Envelope;
use crate::registry::{BroadcastRegistry, Subscription};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use relay_protocol::{codec, ProtocolError, WireMessage};
use std::future::Future;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Errors raised while writing to a subscriber.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The peer is gone.
    #[error("Sink closed")]
    Closed,

    /// Encoding failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The transport side of a session.
#[async_trait]
pub trait EnvelopeSink: Send {
    /// Write one envelope and make it visible to the peer before returning.
    async fn write(&mut self, envelope: &Envelope) -> Result<(), SinkError>;
}

/// Encodes envelopes into newline-terminated JSON lines, reusing one buffer.
#[derive(Debug, Default)]
pub struct LineEncoder {
    buf: BytesMut,
}

impl LineEncoder {
    /// Create an encoder with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Encode one envelope as a complete line, terminator included.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be serialized.
    pub fn encode(&mut self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        codec::encode_into(&WireMessage::from(envelope), &mut self.buf)?;
        Ok(self.buf.split().freeze())
    }
}

/// Writes envelopes as newline-delimited JSON, flushing after each line.
pub struct LineSink<W> {
    writer: W,
    encoder: LineEncoder,
}

impl<W> LineSink<W> {
    /// Wrap a writer.
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            encoder: LineEncoder::new(),
        }
    }

    /// Get the wrapped writer back.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> EnvelopeSink for LineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, envelope: &Envelope) -> Result<(), SinkError> {
        let line = self.encoder.encode(envelope)?;
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Subscribed, hello not yet written.
    Registering,
    /// Draining the queue into the sink.
    Streaming,
    /// Unsubscribed.
    Closed,
}

/// Why a session stopped.
#[derive(Debug)]
pub enum SessionEnd {
    /// The cancellation signal fired.
    Cancelled,
    /// The sink rejected a write.
    WriteFailed(SinkError),
    /// The subscription was closed from elsewhere and its queue drained.
    QueueClosed,
}

/// One subscriber connection.
pub struct DeliverySession {
    subscription: Subscription,
    state: SessionState,
}

impl DeliverySession {
    /// Subscribe to `registry` and return a session in the `Registering` state.
    #[must_use]
    pub fn open(registry: &BroadcastRegistry) -> Self {
        let subscription = registry.subscribe();
        debug!(subscriber = %subscription.id(), "Session registered");
        Self {
            subscription,
            state: SessionState::Registering,
        }
    }

    /// Get the subscriber id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.subscription.id()
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Stream until `cancelled` resolves or the sink fails, then unsubscribe.
    ///
    /// The hello envelope is always the first thing written. Running a
    /// closed session returns [`SessionEnd::QueueClosed`] immediately.
    pub async fn run<S, C>(&mut self, sink: &mut S, cancelled: C) -> SessionEnd
    where
        S: EnvelopeSink + ?Sized,
        C: Future<Output = ()>,
    {
        if self.state == SessionState::Closed {
            return SessionEnd::QueueClosed;
        }

        let end = self.stream(sink, cancelled).await;
        self.close();

        debug!(subscriber = %self.id(), end = ?end, "Session ended");
        end
    }

    async fn stream<S, C>(&mut self, sink: &mut S, cancelled: C) -> SessionEnd
    where
        S: EnvelopeSink + ?Sized,
        C: Future<Output = ()>,
    {
        tokio::pin!(cancelled);

        let hello = Envelope::hello();
        tokio::select! {
            biased;
            () = &mut cancelled => return SessionEnd::Cancelled,
            written = sink.write(&hello) => {
                if let Err(e) = written {
                    return SessionEnd::WriteFailed(e);
                }
            }
        }
        self.state = SessionState::Streaming;

        loop {
            let envelope = tokio::select! {
                biased;
                () = &mut cancelled => return SessionEnd::Cancelled,
                next = self.subscription.recv() => match next {
                    Some(envelope) => envelope,
                    None => return SessionEnd::QueueClosed,
                },
            };

            tokio::select! {
                biased;
                () = &mut cancelled => return SessionEnd::Cancelled,
                written = sink.write(&envelope) => {
                    if let Err(e) = written {
                        return SessionEnd::WriteFailed(e);
                    }
                }
            }
            trace!(subscriber = %self.id(), message = %envelope.id(), "Envelope delivered");
        }
    }

    /// Unsubscribe now. Idempotent.
    pub fn close(&mut self) {
        self.subscription.close();
        self.state = SessionState::Closed;
    }
}
