//! # Turn Buffer Management
//!
//! Accumulates decoded caller audio until the segmenter decides a turn is
//! complete, then hands the whole buffer over in one move.
//!
//! ## Key Features:
//! - **Append-only**: Inbound frames are appended in arrival order (FIFO)
//! - **Atomic drain**: A dispatch takes every buffered byte and leaves an empty buffer
//! - **Format-aware thresholds**: Byte thresholds follow the negotiated sample rate
//! - **Single owner**: Lives inside one call session, so no locking is needed

use serde::{Deserialize, Serialize};

/// Audio format negotiated for one media stream.
///
/// ## Defaults:
/// Telephony media streams carry 8kHz mono μ-law unless the start event
/// says otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Encoding label as announced by the transport (e.g. "audio/x-mulaw")
    pub encoding: String,

    /// Samples per second
    pub sample_rate: u32,

    /// Number of interleaved channels
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            encoding: "audio/x-mulaw".to_string(),
            sample_rate: 8000,
            channels: 1,
        }
    }
}

impl AudioFormat {
    /// Create a μ-law format with the given rate and channel count.
    pub fn mulaw(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            ..Self::default()
        }
    }

    /// Whether the announced encoding is μ-law.
    pub fn is_mulaw(&self) -> bool {
        let encoding = self.encoding.to_ascii_lowercase();
        encoding.contains("mulaw") || encoding.contains("ulaw")
    }

    /// Bytes of decoded PCM16 per second of audio.
    ///
    /// ## Example:
    /// 8000 Hz × 1 channel × 2 bytes = 16,000 bytes per second
    pub fn pcm_bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * 2
    }

    /// Bytes of decoded PCM16 covering `duration_ms` of audio.
    pub fn pcm_bytes_for(&self, duration_ms: u32) -> usize {
        self.pcm_bytes_per_second() * duration_ms as usize / 1000
    }

    /// Bytes of μ-law covering `duration_ms` of audio (one byte per sample).
    pub fn mulaw_bytes_for(&self, duration_ms: u32) -> usize {
        self.sample_rate as usize * self.channels as usize * duration_ms as usize / 1000
    }
}

/// Configuration for turn buffering.
#[derive(Debug, Clone)]
pub struct TurnBufferConfig {
    /// Negotiated stream format (updated on stream start)
    pub format: AudioFormat,

    /// Audio duration that completes a turn (typically 2000ms)
    pub turn_duration_ms: u32,
}

impl Default for TurnBufferConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            turn_duration_ms: 2000,    // 2 seconds per turn
        }
    }
}

impl TurnBufferConfig {
    /// Byte threshold `T_turn` that triggers a dispatch.
    ///
    /// ## Example:
    /// 2000ms at 8kHz mono PCM16 = 32,000 bytes
    pub fn turn_bytes(&self) -> usize {
        self.format.pcm_bytes_for(self.turn_duration_ms)
    }
}

/// Append-only PCM16 accumulator for one call.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    /// Decoded little-endian PCM16 bytes, oldest first
    data: Vec<u8>,

    /// Thresholds and format for this buffer
    config: TurnBufferConfig,
}

impl TurnBuffer {
    /// Create an empty buffer with the given configuration.
    pub fn new(config: TurnBufferConfig) -> Self {
        Self {
            data: Vec::with_capacity(config.turn_bytes()),
            config,
        }
    }

    /// Append decoded PCM16 bytes to the end of the buffer.
    pub fn append_pcm(&mut self, pcm: &[u8]) {
        self.data.extend_from_slice(pcm);
    }

    /// Take every buffered byte, leaving the buffer empty.
    ///
    /// ## Usage:
    /// Called exactly once per dispatched turn; the returned snapshot is
    /// owned by the turn from then on.
    pub fn drain(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    /// Current buffer length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Duration of audio currently buffered (in seconds).
    pub fn duration_seconds(&self) -> f64 {
        self.len() as f64 / self.config.format.pcm_bytes_per_second() as f64
    }

    /// Switch to the format negotiated on stream start.
    pub fn set_format(&mut self, format: AudioFormat) {
        self.config.format = format;
    }

    /// Get a reference to the buffer configuration.
    pub fn config(&self) -> &TurnBufferConfig {
        &self.config
    }
}
