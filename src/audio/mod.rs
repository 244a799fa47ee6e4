//! # Call Audio Module
//!
//! Everything that happens to caller audio before it leaves the process:
//! codec conversion, turn buffering, turn segmentation and the per-call
//! session record that ties them together.
//!
//! ## Key Components:
//! - **Codec**: G.711 μ-law ⇄ 16-bit linear PCM (`codec`)
//! - **WAV framing**: 44-byte RIFF header for speech-to-text uploads (`wav`)
//! - **Turn Buffer**: Append-only PCM accumulator drained once per turn (`buffer`)
//! - **Turn Segmenter**: Threshold and flush-on-mark dispatch rules (`segmenter`)
//! - **Call Session**: Per-connection state, history and processing permit (`session`)
//!
//! ## Audio Format on the Wire:
//! - **Encoding**: 8-bit μ-law, both directions
//! - **Sample Rate**: 8kHz (negotiated on stream start)
//! - **Channels**: Mono
//! - **Internal PCM**: Little-endian signed 16-bit

pub mod buffer;       // Turn buffer and negotiated audio format
pub mod codec;        // μ-law <-> PCM16 conversion
pub mod segmenter;    // Turn dispatch rules
pub mod session;      // Per-call session state
pub mod wav;          // PCM16 -> WAV container

pub use buffer::AudioFormat;
pub use session::{CallSession, ConversationHistory, Role, Turn};
