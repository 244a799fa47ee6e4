//! In-memory fakes for the service and transport traits.

use crate::audio::session::SessionConfig;
use crate::audio::{AudioFormat, CallSession, ConversationHistory, Turn};
use crate::protocol::{OutboundMessage, StreamStart};
use crate::config::AppConfig;
use crate::sender::{OutboundTransport, SendError};
use crate::state::AppState;
use crate::services::{Responder, ServiceError, ServiceHandles, Synthesizer, Transcriber, VoiceSpec};
use crate::services::twilio::CallLauncher;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Start a session on "MZ-test" and dispatch a turn holding `pcm_len`
/// bytes of decoded silence (rounded down to whole samples).
pub fn dispatched_turn(pcm_len: usize) -> (CallSession, Turn) {
    let mut session = CallSession::new(SessionConfig::default());
    session
        .start(StreamStart {
            stream_sid: "MZ-test".to_string(),
            call_sid: None,
            custom_parameters: HashMap::new(),
            format: AudioFormat::default(),
        })
        .unwrap();

    let frame = vec![0xFFu8; pcm_len / 2];
    let turn = match session.ingest_media(&frame) {
        Some(turn) => turn,
        None => session.flush_on_mark("flush").expect("buffer should flush"),
    };
    (session, turn)
}

pub fn services(
    transcriber: impl Into<Arc<FakeTranscriber>>,
    responder: impl Into<Arc<FakeResponder>>,
    synthesizer: impl Into<Arc<FakeSynthesizer>>,
) -> ServiceHandles {
    let transcriber: Arc<FakeTranscriber> = transcriber.into();
    let responder: Arc<FakeResponder> = responder.into();
    let synthesizer: Arc<FakeSynthesizer> = synthesizer.into();
    ServiceHandles {
        transcriber,
        responder,
        synthesizer,
    }
}

/// State with default config, silent fakes and a launcher returning "CA1".
pub fn app_state() -> AppState {
    AppState::new(
        AppConfig::default(),
        services(
            FakeTranscriber::replying(""),
            FakeResponder::replying("hi"),
            FakeSynthesizer::new(),
        ),
        Arc::new(FakeLauncher::new(Ok("CA1".to_string()))),
    )
}

/// Records delivered frames; can be closed or told to fail.
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    open: AtomicBool,
    failures: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Reject the next `count` deliveries with an encode error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundTransport for RecordingTransport {
    async fn deliver(&self, message: OutboundMessage) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SendError::Encode("injected failure".to_string()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct FakeTranscriber {
    result: Result<String, ServiceError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn replying(text: &str) -> Self {
        Self {
            result: Ok(text.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: ServiceError) -> Self {
        Self {
            result: Err(err),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, wav: Vec<u8>, _format: &AudioFormat) -> Result<String, ServiceError> {
        assert_eq!(&wav[0..4], b"RIFF");
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}

pub struct FakeResponder {
    result: Result<String, ServiceError>,
    delay: Option<Duration>,
}

impl FakeResponder {
    pub fn replying(text: &str) -> Self {
        Self {
            result: Ok(text.to_string()),
            delay: None,
        }
    }

    pub fn failing(err: ServiceError) -> Self {
        Self {
            result: Err(err),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Responder for FakeResponder {
    async fn respond(
        &self,
        history: &ConversationHistory,
        latest: &str,
    ) -> Result<String, ServiceError> {
        assert_eq!(history.last().map(|u| u.text.as_str()), Some(latest));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}

/// Answers by exact text, with `"*"` as the catch-all.
pub struct FakeSynthesizer {
    scripted: HashMap<String, Result<Vec<u8>, ServiceError>>,
    requests: Mutex<Vec<String>>,
}

impl FakeSynthesizer {
    pub fn new() -> Self {
        Self {
            scripted: HashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, text: &str, result: Result<Vec<u8>, ServiceError>) -> Self {
        self.scripted.insert(text.to_string(), result);
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &VoiceSpec) -> Result<Vec<u8>, ServiceError> {
        self.requests.lock().unwrap().push(text.to_string());
        self.scripted
            .get(text)
            .or_else(|| self.scripted.get("*"))
            .cloned()
            .unwrap_or(Err(ServiceError::EmptyResponse))
    }
}

/// Returns a fixed call SID and remembers who was dialed.
pub struct FakeLauncher {
    result: Result<String, ServiceError>,
    dialed: Mutex<Vec<String>>,
}

impl FakeLauncher {
    pub fn new(result: Result<String, ServiceError>) -> Self {
        Self {
            result,
            dialed: Mutex::new(Vec::new()),
        }
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallLauncher for FakeLauncher {
    async fn create_call(&self, to: &str) -> Result<String, ServiceError> {
        self.dialed.lock().unwrap().push(to.to_string());
        self.result.clone()
    }
}
