//! # Turn Pipeline
//!
//! Turns one dispatched snapshot of caller audio into a spoken reply, or
//! into a well-defined skip or failure.
//!
//! ## Stages:
//! 1. **Received**: snapshots under the minimum size are skipped
//! 2. **Framed**: PCM is wrapped in a WAV container
//! 3. **Transcribing**: empty, short, failed or timed-out transcripts are skipped
//! 4. **Transcribed**: the user line is appended to the history
//! 5. **Reasoning**: failures and empty replies fall back to the configured offer
//! 6. **Replied**: the assistant line is appended to the history
//! 7. **Synthesizing**: one substitution with the fallback utterance, then fail
//! 8. **Delivering**: audio then mark; a send error gets the same single
//!    substitution if it has not been used yet
//!
//! Every external call runs under its own deadline. No stage error escapes
//! `run`; the returned [`TurnReport`] always carries the permit back.

mod outcome;

pub use outcome::{FailReason, SkipReason, TurnOutcome, TurnReport};

use crate::audio::{wav, Role, Turn};
use crate::config::AppConfig;
use crate::sender::{OutputSender, SendError};
use crate::services::{with_timeout, ServiceError, ServiceHandles, VoiceSpec};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Prefix of the mark sent after each reply; the turn id is appended.
pub const MARK_PREFIX: &str = "response-complete";

/// Tunables captured when a call starts.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub min_turn_ms: u32,
    pub min_transcript_chars: usize,
    pub transcription_timeout: Duration,
    pub reasoning_timeout: Duration,
    pub synthesis_timeout: Duration,
    pub voice: VoiceSpec,
    pub fallback_reply: String,
    pub fallback_utterance: String,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            min_turn_ms: config.audio.min_turn_ms,
            min_transcript_chars: config.audio.min_transcript_chars,
            transcription_timeout: config.speech.stt_timeout(),
            reasoning_timeout: config.reasoning.timeout(),
            synthesis_timeout: config.speech.tts_timeout(),
            voice: VoiceSpec::from_config(config),
            fallback_reply: config.fallback.reply.clone(),
            fallback_utterance: config.fallback.utterance.clone(),
        }
    }
}

/// Runs turns against the shared service handles. Cheap to clone.
#[derive(Clone)]
pub struct TurnPipeline {
    services: ServiceHandles,
    settings: Arc<PipelineSettings>,
}

impl TurnPipeline {
    pub fn new(services: ServiceHandles, settings: PipelineSettings) -> Self {
        Self {
            services,
            settings: Arc::new(settings),
        }
    }

    /// Process one turn to a terminal state.
    pub async fn run(&self, mut turn: Turn, sender: &OutputSender) -> TurnReport {
        let started = Instant::now();
        let stream_sid = turn.stream_sid.clone();
        let turn_id = turn.id;
        debug!(
            stream_sid = %stream_sid,
            turn = turn_id,
            trigger = turn.trigger.as_str(),
            bytes = turn.pcm.len(),
            "Processing turn"
        );

        // 1. Received
        let min_bytes = turn.format.pcm_bytes_for(self.settings.min_turn_ms);
        if turn.pcm.len() < min_bytes {
            let reason = SkipReason::TooShort {
                bytes: turn.pcm.len(),
                min_bytes,
            };
            return finish(TurnReport::from_turn(turn, TurnOutcome::Skipped(reason)), started, &stream_sid);
        }

        // 2. Framed
        let pcm = std::mem::take(&mut turn.pcm);
        let container = wav::frame_container(&pcm, turn.format.sample_rate, turn.format.channels);
        drop(pcm);

        // 3. Transcribing
        let transcript = match with_timeout(
            self.settings.transcription_timeout,
            self.services.transcriber.transcribe(container, &turn.format),
        )
        .await
        {
            Ok(text) => text.trim().to_string(),
            Err(err) => {
                warn!(stream_sid = %stream_sid, turn = turn_id, error = %err, "Transcription failed, skipping turn");
                let outcome = TurnOutcome::Skipped(SkipReason::TranscriptionFailed(err));
                return finish(TurnReport::from_turn(turn, outcome), started, &stream_sid);
            }
        };

        if transcript.chars().count() < self.settings.min_transcript_chars {
            let reason = if transcript.is_empty() {
                SkipReason::EmptyTranscript
            } else {
                SkipReason::ShortTranscript(transcript)
            };
            debug!(stream_sid = %stream_sid, turn = turn_id, %reason, "Continuing to listen");
            return finish(TurnReport::from_turn(turn, TurnOutcome::Skipped(reason)), started, &stream_sid);
        }

        // 4. Transcribed
        info!(stream_sid = %stream_sid, turn = turn_id, transcript = %transcript, "Caller said");
        turn.history.push(Role::User, transcript.clone());

        // 5. Reasoning
        let (reply, fallback_reply) = match with_timeout(
            self.settings.reasoning_timeout,
            self.services.responder.respond(&turn.history, &transcript),
        )
        .await
        {
            Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), false),
            Ok(_) => {
                warn!(stream_sid = %stream_sid, turn = turn_id, "Empty reply, using fallback offer");
                (self.settings.fallback_reply.clone(), true)
            }
            Err(err) => {
                warn!(
                    stream_sid = %stream_sid,
                    turn = turn_id,
                    error = %err,
                    "Reply generation failed, using fallback offer"
                );
                (self.settings.fallback_reply.clone(), true)
            }
        };

        // 6. Replied
        info!(stream_sid = %stream_sid, turn = turn_id, reply = %reply, fallback_reply, "Agent reply");
        turn.history.push(Role::Assistant, reply.clone());

        // 7-8. Synthesizing and delivering
        let mark = format!("{}-{}", MARK_PREFIX, turn_id);
        let (outcome, audio_bytes) = self.speak(&stream_sid, turn_id, &reply, &mark, sender).await;

        let mut report = TurnReport::from_turn(turn, outcome);
        report.transcript = Some(transcript);
        report.reply = Some(reply);
        report.fallback_reply = fallback_reply;
        report.audio_bytes = audio_bytes;
        finish(report, started, &stream_sid)
    }

    /// Synthesize and deliver `reply`, substituting the fallback utterance at
    /// most once across both steps.
    async fn speak(
        &self,
        stream_sid: &str,
        turn_id: u64,
        reply: &str,
        mark: &str,
        sender: &OutputSender,
    ) -> (TurnOutcome, usize) {
        let mut fallback_audio = false;

        let audio = match self.synthesize(reply).await {
            Ok(audio) => audio,
            Err(err) => {
                warn!(stream_sid, turn = turn_id, error = %err, "Synthesis failed, trying fallback utterance");
                fallback_audio = true;
                match self.synthesize(&self.settings.fallback_utterance).await {
                    Ok(audio) => audio,
                    Err(err) => {
                        return (TurnOutcome::Failed(FailReason::Synthesis(err)), 0);
                    }
                }
            }
        };

        if !sender.is_open() {
            return (TurnOutcome::Failed(FailReason::TransportClosed), 0);
        }

        let err = match sender.send_turn(stream_sid, &audio, mark).await {
            Ok(()) => return (TurnOutcome::Delivered { fallback_audio }, audio.len()),
            Err(SendError::Closed) => {
                return (TurnOutcome::Failed(FailReason::TransportClosed), 0);
            }
            Err(err) if fallback_audio => {
                return (TurnOutcome::Failed(FailReason::Send(err)), 0);
            }
            Err(err) => err,
        };

        warn!(stream_sid, turn = turn_id, error = %err, "Delivery failed, trying fallback utterance");
        let audio = match self.synthesize(&self.settings.fallback_utterance).await {
            Ok(audio) => audio,
            Err(err) => return (TurnOutcome::Failed(FailReason::Synthesis(err)), 0),
        };

        match sender.send_turn(stream_sid, &audio, mark).await {
            Ok(()) => (TurnOutcome::Delivered { fallback_audio: true }, audio.len()),
            Err(SendError::Closed) => (TurnOutcome::Failed(FailReason::TransportClosed), 0),
            Err(err) => (TurnOutcome::Failed(FailReason::Send(err)), 0),
        }
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ServiceError> {
        let audio = with_timeout(
            self.settings.synthesis_timeout,
            self.services.synthesizer.synthesize(text, &self.settings.voice),
        )
        .await?;
        if audio.is_empty() {
            return Err(ServiceError::EmptyResponse);
        }
        Ok(audio)
    }
}

fn finish(mut report: TurnReport, started: Instant, stream_sid: &str) -> TurnReport {
    report.elapsed = started.elapsed();
    match &report.outcome {
        TurnOutcome::Skipped(reason) => debug!(
            stream_sid,
            turn = report.turn_id,
            %reason,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Turn skipped"
        ),
        TurnOutcome::Delivered { fallback_audio } => info!(
            stream_sid,
            turn = report.turn_id,
            fallback_audio,
            reply_chars = report.reply.as_deref().map_or(0, |r| r.chars().count()),
            audio_bytes = report.audio_bytes,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Turn delivered"
        ),
        TurnOutcome::Failed(reason) => warn!(
            stream_sid,
            turn = report.turn_id,
            %reason,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Turn failed"
        ),
    }
    report
}
