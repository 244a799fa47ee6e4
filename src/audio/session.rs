//! # Call Session Management
//!
//! One `CallSession` exists per media-stream connection. It owns the turn
//! buffer, the bounded conversation history and the processing permit, and
//! it is mutated only by the connection actor that created it.
//!
//! ## Session Lifecycle:
//! 1. **AwaitingStart**: Connection open, stream SID not yet known
//! 2. **Streaming**: Start received, media is buffered and turns are dispatched
//! 3. **Stopped**: Stop received or connection closed; nothing else is dispatched
//!
//! ## Single-Flight Turns:
//! The processing flag is a one-permit semaphore. Dispatch takes the permit
//! and moves it into the `Turn`; the permit comes back inside the pipeline's
//! report and is dropped when the session applies that report. If the
//! in-flight turn is cancelled the permit is dropped with it, so no path can
//! leave the session stuck in `processing`.

use crate::audio::buffer::{AudioFormat, TurnBuffer, TurnBufferConfig};
use crate::audio::codec;
use crate::audio::segmenter::{TurnSegmenter, TurnTrigger};
use crate::pipeline::TurnReport;
use crate::protocol::StreamStart;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum utterances kept in a conversation history.
pub const DEFAULT_HISTORY_LIMIT: usize = 12;

/// Who spoke an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One line of dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Utterance {
    pub role: Role,
    pub text: String,
}

/// Ordered dialogue history bounded to the most recent `limit` entries.
///
/// ## Invariant:
/// `len() <= limit` after every push; the oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    entries: VecDeque<Utterance>,
    limit: usize,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ConversationHistory {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Append an utterance, evicting the oldest entries beyond the limit.
    pub fn push(&mut self, role: Role, text: impl Into<String>) {
        self.entries.push_back(Utterance {
            role,
            text: text.into(),
        });
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Render as `role: text` lines, oldest first.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|u| format!("{}: {}", u.role.as_str(), u.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
impl ConversationHistory {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utterance> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&Utterance> {
        self.entries.back()
    }
}

/// Guard for the session's single processing permit.
///
/// Dropping it marks the session idle again.
#[derive(Debug)]
pub struct TurnPermit {
    _permit: OwnedSemaphorePermit,
}

/// One dispatched unit of work. Not retained after the pipeline finishes.
#[derive(Debug)]
pub struct Turn {
    /// Sequence number within the call, starting at 1
    pub id: u64,

    /// Stream the reply is addressed to (always known at dispatch)
    pub stream_sid: String,

    /// PCM16 snapshot drained from the buffer
    pub pcm: Vec<u8>,

    /// Negotiated format of `pcm`
    pub format: AudioFormat,

    /// History checked out for the duration of the turn
    pub history: ConversationHistory,

    /// What caused the dispatch
    pub trigger: TurnTrigger,

    /// Processing permit, released when the turn's report is applied or dropped
    pub permit: TurnPermit,
}

/// Current status of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Connection open, no start event yet
    AwaitingStart,
    /// Stream started, media flowing
    Streaming,
    /// Stop received
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::AwaitingStart => "awaiting_start",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Stopped => "stopped",
        }
    }
}

/// Settings a session is created with.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Format assumed until the start event announces one
    pub default_format: AudioFormat,

    /// Audio duration that completes a turn
    pub turn_duration_ms: u32,

    /// Maximum history entries
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_format: AudioFormat::default(),
            turn_duration_ms: 2000,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Per-connection call state.
pub struct CallSession {
    /// Locally generated id used in logs before the stream SID is known
    pub connection_id: Uuid,

    /// Transport-assigned stream identifier (immutable once set)
    stream_sid: Option<String>,

    /// Telephony call identifier, if the transport sent one
    call_sid: Option<String>,

    /// Custom parameters passed through from the call markup
    custom_parameters: HashMap<String, String>,

    status: SessionStatus,

    /// Decoded caller audio awaiting dispatch
    buffer: TurnBuffer,

    segmenter: TurnSegmenter,

    /// One-permit semaphore acting as the processing flag
    gate: Arc<Semaphore>,

    /// Dialogue so far (checked out into the turn while one is in flight)
    history: ConversationHistory,

    history_limit: usize,

    pub started_at: DateTime<Utc>,

    last_activity_at: DateTime<Utc>,

    /// Inbound media frames received (media events only)
    frames_received: u64,

    /// Turns whose transcript qualified and reached the reasoning stage
    responses: u32,

    turns_dispatched: u64,
}

impl CallSession {
    /// Create a fresh session for a newly opened connection.
    pub fn new(config: SessionConfig) -> Self {
        let buffer = TurnBuffer::new(TurnBufferConfig {
            format: config.default_format,
            turn_duration_ms: config.turn_duration_ms,
        });
        let segmenter = TurnSegmenter::new(buffer.config().turn_bytes());
        let now = Utc::now();

        Self {
            connection_id: Uuid::new_v4(),
            stream_sid: None,
            call_sid: None,
            custom_parameters: HashMap::new(),
            status: SessionStatus::AwaitingStart,
            buffer,
            segmenter,
            gate: Arc::new(Semaphore::new(1)),
            history: ConversationHistory::new(config.history_limit),
            history_limit: config.history_limit,
            started_at: now,
            last_activity_at: now,
            frames_received: 0,
            responses: 0,
            turns_dispatched: 0,
        }
    }

    /// Record inbound activity.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Apply a start event.
    ///
    /// ## Errors:
    /// Returns an error if a different stream SID was already assigned; the
    /// session keeps its original SID in that case.
    pub fn start(&mut self, start: StreamStart) -> Result<(), String> {
        self.touch();

        if let Some(existing) = &self.stream_sid {
            if existing != &start.stream_sid {
                return Err(format!(
                    "stream already started as {}, ignoring start for {}",
                    existing, start.stream_sid
                ));
            }
            return Ok(());
        }

        if !start.format.is_mulaw() {
            warn!(
                encoding = %start.format.encoding,
                "Unexpected media encoding, decoding as mu-law anyway"
            );
        }

        self.buffer.set_format(start.format);
        self.segmenter = TurnSegmenter::new(self.buffer.config().turn_bytes());
        self.stream_sid = Some(start.stream_sid);
        self.call_sid = start.call_sid;
        self.custom_parameters = start.custom_parameters;
        self.status = SessionStatus::Streaming;

        info!(
            connection_id = %self.connection_id,
            stream_sid = ?self.stream_sid,
            call_sid = ?self.call_sid,
            sample_rate = self.buffer.config().format.sample_rate,
            turn_bytes = self.segmenter.turn_bytes(),
            "Media stream started"
        );
        Ok(())
    }

    /// Decode and buffer one μ-law media frame, dispatching a turn if the
    /// threshold rule fires.
    pub fn ingest_media(&mut self, frame: &[u8]) -> Option<Turn> {
        self.touch();
        self.frames_received += 1;
        self.buffer.append_pcm(&codec::decode(frame));

        if self.frames_received % 50 == 0 {
            debug!(
                stream_sid = ?self.stream_sid,
                frames = self.frames_received,
                buffered_bytes = self.buffer.len(),
                "Buffering caller audio"
            );
        }

        let trigger = self
            .segmenter
            .on_media(self.buffer.len(), self.is_processing())?;
        self.dispatch(trigger)
    }

    /// Handle a mark event, flushing any buffered audio as a turn.
    pub fn flush_on_mark(&mut self, name: &str) -> Option<Turn> {
        self.touch();
        let trigger = self
            .segmenter
            .on_mark(name, self.buffer.len(), self.is_processing())?;
        self.dispatch(trigger)
    }

    /// Handle a stop event. No turn is dispatched afterwards.
    pub fn stop(&mut self) {
        self.touch();
        self.status = SessionStatus::Stopped;
    }

    /// Whether a turn is currently in flight.
    pub fn is_processing(&self) -> bool {
        self.gate.available_permits() == 0
    }

    /// Drain the buffer into a new turn if a permit is available.
    fn dispatch(&mut self, trigger: TurnTrigger) -> Option<Turn> {
        if self.status == SessionStatus::Stopped {
            return None;
        }

        // Replies need an address; audio before start stays buffered
        let stream_sid = match &self.stream_sid {
            Some(sid) => sid.clone(),
            None => {
                debug!(
                    connection_id = %self.connection_id,
                    buffered_bytes = self.buffer.len(),
                    "Turn ready before stream start, holding audio"
                );
                return None;
            }
        };

        let permit = self.gate.clone().try_acquire_owned().ok()?;

        self.turns_dispatched += 1;
        let pcm = self.buffer.drain();
        let history = std::mem::replace(
            &mut self.history,
            ConversationHistory::new(self.history_limit),
        );

        info!(
            stream_sid = %stream_sid,
            turn = self.turns_dispatched,
            trigger = trigger.as_str(),
            bytes = pcm.len(),
            "Dispatching turn"
        );

        Some(Turn {
            id: self.turns_dispatched,
            stream_sid,
            pcm,
            format: self.buffer.config().format.clone(),
            history,
            trigger,
            permit: TurnPermit { _permit: permit },
        })
    }

    /// Apply a finished turn's report and release the processing permit.
    pub fn complete_turn(&mut self, report: TurnReport) {
        let TurnReport {
            turn_id,
            outcome,
            transcript,
            history,
            permit,
            ..
        } = report;

        self.history = history;
        if transcript.is_some() {
            self.responses += 1;
        }
        drop(permit);

        debug!(
            stream_sid = ?self.stream_sid,
            turn = turn_id,
            outcome = outcome.as_str(),
            history_len = self.history.len(),
            "Turn completed, session idle"
        );
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn custom_parameters(&self) -> &HashMap<String, String> {
        &self.custom_parameters
    }

    /// Time since the last inbound event.
    pub fn idle_for(&self) -> std::time::Duration {
        Utc::now()
            .signed_duration_since(self.last_activity_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Snapshot for periodic and closing log lines.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            connection_id: self.connection_id,
            stream_sid: self.stream_sid.clone(),
            status: self.status.as_str(),
            frames_received: self.frames_received,
            buffered_seconds: self.buffer.duration_seconds(),
            turns_dispatched: self.turns_dispatched,
            responses: self.responses,
            processing: self.is_processing(),
            duration_seconds: Utc::now()
                .signed_duration_since(self.started_at)
                .num_milliseconds() as f64
                / 1000.0,
        }
    }
}

#[cfg(test)]
impl CallSession {
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn responses(&self) -> u32 {
        self.responses
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub connection_id: Uuid,
    pub stream_sid: Option<String>,
    pub status: &'static str,
    pub frames_received: u64,
    pub buffered_seconds: f64,
    pub turns_dispatched: u64,
    pub responses: u32,
    pub processing: bool,
    pub duration_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{SkipReason, TurnOutcome};

    /// 20ms of μ-law silence at 8kHz
    const FRAME: [u8; 160] = [0xFF; 160];

    fn started_session() -> CallSession {
        let mut session = CallSession::new(SessionConfig::default());
        session
            .start(StreamStart {
                stream_sid: "MZ123".to_string(),
                call_sid: Some("CA456".to_string()),
                custom_parameters: HashMap::new(),
                format: AudioFormat::default(),
            })
            .unwrap();
        session
    }

    /// Feed frames until a turn is dispatched or `max_frames` is reached.
    fn feed(session: &mut CallSession, max_frames: usize) -> (usize, Option<Turn>) {
        for sent in 1..=max_frames {
            if let Some(turn) = session.ingest_media(&FRAME) {
                return (sent, Some(turn));
            }
        }
        (max_frames, None)
    }

    #[test]
    fn test_new_session_is_idle_and_empty() {
        let session = CallSession::new(SessionConfig::default());
        assert_eq!(session.status(), SessionStatus::AwaitingStart);
        assert!(!session.is_processing());
        assert!(session.history().is_empty());
        assert_eq!(session.buffered_bytes(), 0);
        assert_eq!(session.frames_received(), 0);
    }

    #[test]
    fn test_threshold_dispatches_exactly_once() {
        let mut session = started_session();

        // 100 frames × 160 bytes × 2 = 32,000 bytes of PCM
        let (sent, turn) = feed(&mut session, 200);
        let turn = turn.expect("turn should be dispatched at the threshold");

        assert_eq!(sent, 100);
        assert_eq!(turn.id, 1);
        assert_eq!(turn.pcm.len(), 32000);
        assert_eq!(turn.stream_sid, "MZ123");
        assert_eq!(turn.trigger, TurnTrigger::Threshold);
        assert_eq!(session.buffered_bytes(), 0);
        assert!(session.is_processing());
    }

    #[test]
    fn test_single_flight_until_permit_released() {
        let mut session = started_session();
        let (_, first) = feed(&mut session, 100);
        let first = first.unwrap();

        // Another full turn of audio arrives while the first is in flight
        let (_, second) = feed(&mut session, 150);
        assert!(second.is_none());
        assert_eq!(session.buffered_bytes(), 150 * 320);

        let report = TurnReport::from_turn(first, TurnOutcome::Skipped(SkipReason::EmptyTranscript));
        session.complete_turn(report);
        assert!(!session.is_processing());

        // Completion alone does not dispatch; the next event re-evaluates
        assert_eq!(session.buffered_bytes(), 150 * 320);
        let next = session.ingest_media(&FRAME).unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(next.pcm.len(), 151 * 320);
    }

    #[test]
    fn test_dropped_turn_releases_permit() {
        let mut session = started_session();
        let (_, turn) = feed(&mut session, 100);
        assert!(session.is_processing());
        drop(turn);
        assert!(!session.is_processing());
    }

    #[test]
    fn test_mark_flushes_partial_buffer() {
        let mut session = started_session();
        for _ in 0..10 {
            assert!(session.ingest_media(&FRAME).is_none());
        }
        assert_eq!(session.buffered_bytes(), 3200);

        let turn = session.flush_on_mark("response-complete-1").unwrap();
        assert_eq!(turn.pcm.len(), 3200);
        assert_eq!(
            turn.trigger,
            TurnTrigger::Mark("response-complete-1".to_string())
        );
        assert_eq!(session.buffered_bytes(), 0);
    }

    #[test]
    fn test_mark_with_empty_buffer_or_busy_session_does_nothing() {
        let mut session = started_session();
        assert!(session.flush_on_mark("m").is_none());

        let (_, _in_flight) = feed(&mut session, 100);
        session.ingest_media(&FRAME);
        assert!(session.flush_on_mark("m").is_none());
        assert_eq!(session.buffered_bytes(), 320);
    }

    #[test]
    fn test_audio_before_start_is_held() {
        let mut session = CallSession::new(SessionConfig::default());
        let (_, turn) = feed(&mut session, 120);
        assert!(turn.is_none());
        assert_eq!(session.buffered_bytes(), 120 * 320);

        session
            .start(StreamStart {
                stream_sid: "MZ1".to_string(),
                call_sid: None,
                custom_parameters: HashMap::new(),
                format: AudioFormat::default(),
            })
            .unwrap();
        let turn = session.ingest_media(&FRAME).unwrap();
        assert_eq!(turn.pcm.len(), 121 * 320);
    }

    #[test]
    fn test_stream_sid_is_immutable() {
        let mut session = started_session();
        let result = session.start(StreamStart {
            stream_sid: "MZ999".to_string(),
            call_sid: None,
            custom_parameters: HashMap::new(),
            format: AudioFormat::default(),
        });
        assert!(result.is_err());
        assert_eq!(session.stream_sid(), Some("MZ123"));
    }

    #[test]
    fn test_start_keeps_custom_parameters() {
        let mut session = CallSession::new(SessionConfig::default());
        let mut params = HashMap::new();
        params.insert("campaign".to_string(), "spring".to_string());
        session
            .start(StreamStart {
                stream_sid: "MZ7".to_string(),
                call_sid: Some("CA7".to_string()),
                custom_parameters: params,
                format: AudioFormat::default(),
            })
            .unwrap();
        assert_eq!(
            session.custom_parameters().get("campaign").map(String::as_str),
            Some("spring")
        );
    }

    #[test]
    fn test_touch_resets_idle_time() {
        let mut session = started_session();
        session.last_activity_at = Utc::now() - chrono::Duration::seconds(90);
        assert!(session.idle_for() >= std::time::Duration::from_secs(89));

        session.touch();
        assert!(session.idle_for() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_stopped_session_never_dispatches() {
        let mut session = started_session();
        session.stop();
        let (_, turn) = feed(&mut session, 120);
        assert!(turn.is_none());
        assert!(session.flush_on_mark("m").is_none());
    }

    #[test]
    fn test_history_bound() {
        let mut history = ConversationHistory::new(12);
        for i in 0..40 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            history.push(role, format!("line {}", i));
            assert!(history.len() <= 12);
        }
        assert_eq!(history.len(), 12);
        let texts: Vec<_> = history.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts.first(), Some(&"line 28"));
        assert_eq!(texts.last(), Some(&"line 39"));
    }

    #[test]
    fn test_history_render() {
        let mut history = ConversationHistory::default();
        history.push(Role::User, "hello");
        history.push(Role::Assistant, "hi there");
        assert_eq!(history.render(), "user: hello\nassistant: hi there");
    }

    #[test]
    fn test_history_returns_with_report() {
        let mut session = started_session();
        let (_, turn) = feed(&mut session, 100);
        let mut turn = turn.unwrap();
        turn.history.push(Role::User, "what offers do you have");
        turn.history.push(Role::Assistant, "twenty percent extra balance");

        let mut report = TurnReport::from_turn(turn, TurnOutcome::Delivered { fallback_audio: false });
        report.transcript = Some("what offers do you have".to_string());
        session.complete_turn(report);

        assert_eq!(session.history().len(), 2);
        assert_eq!(session.responses(), 1);
    }
}
