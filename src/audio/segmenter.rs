//! # Turn Segmentation
//!
//! Decides when the buffered caller audio is a complete turn.
//!
//! ## Rules:
//! - **Threshold**: media that brings the buffer to `T_turn` bytes dispatches it
//! - **Flush on mark**: a mark event dispatches any non-empty buffer
//! - **Backpressure**: while a turn is processing nothing is dispatched; the
//!   buffer keeps growing and the next event re-evaluates
//!
//! Small buffers are never filtered here. The pipeline decides whether a
//! snapshot is long enough to be worth transcribing.

/// Why a turn was dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnTrigger {
    /// Buffered audio reached the turn threshold
    Threshold,
    /// A mark event flushed the buffer early
    Mark(String),
}

impl TurnTrigger {
    pub fn as_str(&self) -> &str {
        match self {
            TurnTrigger::Threshold => "threshold",
            TurnTrigger::Mark(_) => "mark",
        }
    }
}

/// Stateless dispatch rules for one session.
#[derive(Debug, Clone, Copy)]
pub struct TurnSegmenter {
    /// Byte threshold `T_turn`
    turn_bytes: usize,
}

impl TurnSegmenter {
    pub fn new(turn_bytes: usize) -> Self {
        Self { turn_bytes }
    }

    pub fn turn_bytes(&self) -> usize {
        self.turn_bytes
    }

    /// Evaluate the threshold rule after inbound media.
    pub fn on_media(&self, buffered: usize, processing: bool) -> Option<TurnTrigger> {
        if processing || buffered == 0 || buffered < self.turn_bytes {
            return None;
        }
        Some(TurnTrigger::Threshold)
    }

    /// Evaluate the flush rule for a mark event.
    pub fn on_mark(&self, name: &str, buffered: usize, processing: bool) -> Option<TurnTrigger> {
        if processing || buffered == 0 {
            return None;
        }
        Some(TurnTrigger::Mark(name.to_string()))
    }
}
