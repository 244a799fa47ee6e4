//! Terminal states of a turn and the report handed back to the session.

use crate::audio::session::TurnPermit;
use crate::audio::{ConversationHistory, Turn};
use crate::sender::SendError;
use crate::services::ServiceError;

use std::fmt;
use std::time::Duration;

/// Why a turn produced no reply. None of these are errors from the
/// caller's point of view; the session simply keeps listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Snapshot below the minimum viable size
    TooShort { bytes: usize, min_bytes: usize },
    /// Transcript was empty after trimming
    EmptyTranscript,
    /// Transcript was shorter than the minimum character count
    ShortTranscript(String),
    /// Both transcription attempts failed or timed out
    TranscriptionFailed(ServiceError),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooShort { bytes, min_bytes } => {
                write!(f, "audio too short ({} < {} bytes)", bytes, min_bytes)
            }
            SkipReason::EmptyTranscript => write!(f, "no speech detected"),
            SkipReason::ShortTranscript(text) => write!(f, "transcript too short: {:?}", text),
            SkipReason::TranscriptionFailed(err) => write!(f, "transcription failed: {}", err),
        }
    }
}

/// Why a turn that had something to say delivered nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// Reply and fallback utterance both failed to synthesize
    Synthesis(ServiceError),
    /// Delivery failed and no further substitution was allowed
    Send(SendError),
    /// The connection closed before delivery
    TransportClosed,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::Synthesis(err) => write!(f, "synthesis failed: {}", err),
            FailReason::Send(err) => write!(f, "delivery failed: {}", err),
            FailReason::TransportClosed => write!(f, "transport closed"),
        }
    }
}

/// Terminal state of one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Skipped(SkipReason),
    /// Audio and mark were handed to the transport
    Delivered {
        /// The fixed fallback utterance was spoken instead of the reply
        fallback_audio: bool,
    },
    Failed(FailReason),
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Skipped(_) => "skipped",
            TurnOutcome::Delivered { .. } => "delivered",
            TurnOutcome::Failed(_) => "failed",
        }
    }
}

/// Everything a finished turn hands back to its session.
///
/// Applying the report restores the history and drops the permit, so the
/// session becomes idle in exactly one place.
#[derive(Debug)]
pub struct TurnReport {
    pub turn_id: u64,
    pub outcome: TurnOutcome,

    /// Set once a transcript qualified
    pub transcript: Option<String>,

    /// Reply text, set once the reasoning stage ran
    pub reply: Option<String>,

    /// The reply is the configured fallback offer
    pub fallback_reply: bool,

    /// Egress audio bytes handed to the transport
    pub audio_bytes: usize,

    pub elapsed: Duration,
    pub history: ConversationHistory,
    pub permit: TurnPermit,
}

impl TurnReport {
    /// Close out `turn` with `outcome`, taking back its history and permit.
    pub fn from_turn(turn: Turn, outcome: TurnOutcome) -> Self {
        Self {
            turn_id: turn.id,
            outcome,
            transcript: None,
            reply: None,
            fallback_reply: false,
            audio_bytes: 0,
            elapsed: Duration::ZERO,
            history: turn.history,
            permit: turn.permit,
        }
    }
}
