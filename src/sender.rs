//! # Output Sender
//!
//! Delivers synthesized audio and playback markers to the media stream.
//!
//! ## Delivery Contract:
//! - Audio for a turn is sent before that turn's mark
//! - Exactly one mark follows a successful audio send
//! - A closed transport is never written to
//!
//! By default the whole utterance goes out as one media message. Paced
//! delivery splits it into fixed-duration frames spaced in real time, for
//! transports that do not buffer long payloads.

use crate::audio::AudioFormat;
use crate::protocol::OutboundMessage;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Failure to hand a message to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The connection is gone
    Closed,
    /// The message could not be serialized
    Encode(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed => write!(f, "transport closed"),
            SendError::Encode(msg) => write!(f, "failed to encode outbound message: {}", msg),
        }
    }
}

impl std::error::Error for SendError {}

/// Sink for outbound frames. Implemented by the WebSocket actor's address;
/// tests substitute an in-memory recorder.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn deliver(&self, message: OutboundMessage) -> Result<(), SendError>;

    /// Whether the connection can still accept frames.
    fn is_open(&self) -> bool;
}

/// Frame size and spacing for paced delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePacing {
    pub frame_bytes: usize,
    pub interval: Duration,
}

impl FramePacing {
    /// Pacing for `frame_ms` frames of μ-law audio in `format`.
    ///
    /// ## Example:
    /// 20ms at 8kHz mono = 160 bytes every 20ms
    pub fn for_format(format: &AudioFormat, frame_ms: u32) -> Self {
        Self {
            frame_bytes: format.mulaw_bytes_for(frame_ms).max(1),
            interval: Duration::from_millis(frame_ms as u64),
        }
    }
}

/// Writes a turn's reply to one stream.
#[derive(Clone)]
pub struct OutputSender {
    transport: Arc<dyn OutboundTransport>,
    pacing: Option<FramePacing>,
}

impl OutputSender {
    pub fn new(transport: Arc<dyn OutboundTransport>) -> Self {
        Self {
            transport,
            pacing: None,
        }
    }

    pub fn with_pacing(mut self, pacing: Option<FramePacing>) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Send egress-codec audio to `stream_sid`.
    pub async fn send(&self, stream_sid: &str, audio: &[u8]) -> Result<(), SendError> {
        if !self.transport.is_open() {
            return Err(SendError::Closed);
        }

        match self.pacing {
            None => {
                self.transport
                    .deliver(OutboundMessage::media(stream_sid, audio))
                    .await
            }
            Some(pacing) => {
                let frames = audio.chunks(pacing.frame_bytes).count();
                debug!(stream_sid, bytes = audio.len(), frames, "Sending paced audio");

                for (index, frame) in audio.chunks(pacing.frame_bytes).enumerate() {
                    if index > 0 {
                        tokio::time::sleep(pacing.interval).await;
                    }
                    self.transport
                        .deliver(OutboundMessage::media(stream_sid, frame))
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Send a playback marker to `stream_sid`.
    pub async fn send_mark(&self, stream_sid: &str, name: &str) -> Result<(), SendError> {
        if !self.transport.is_open() {
            return Err(SendError::Closed);
        }
        self.transport
            .deliver(OutboundMessage::mark(stream_sid, name))
            .await
    }

    /// Send audio followed by its mark. The mark is skipped if the audio fails.
    pub async fn send_turn(
        &self,
        stream_sid: &str,
        audio: &[u8],
        mark_name: &str,
    ) -> Result<(), SendError> {
        self.send(stream_sid, audio).await?;
        self.send_mark(stream_sid, mark_name).await
    }
}
