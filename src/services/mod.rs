//! # External Speech Services
//!
//! The turn pipeline talks to three remote collaborators through narrow
//! traits, so the providers can be swapped (or faked in tests) without
//! touching the pipeline:
//!
//! - [`Transcriber`]: WAV audio → text (possibly empty)
//! - [`Responder`]: dialogue history + latest utterance → reply text
//! - [`Synthesizer`]: text + voice → egress-codec audio bytes
//!
//! Concrete clients are built once at startup from configuration and
//! shared as `Arc<dyn Trait>` handles by every call.

pub mod elevenlabs;
pub mod gemini;
pub mod twilio;

use crate::audio::{AudioFormat, ConversationHistory};
use crate::config::AppConfig;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Failure of a remote service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The service answered with a non-success status
    Http { status: u16, message: String },
    /// The request never completed (DNS, TLS, connection reset, bad body)
    Transport(String),
    /// The call exceeded its deadline
    Timeout(Duration),
    /// The call succeeded but returned nothing usable
    EmptyResponse,
    /// The client is missing a key or has an unusable setting
    Config(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Http { status, message } => write!(f, "HTTP {}: {}", status, message),
            ServiceError::Transport(msg) => write!(f, "transport error: {}", msg),
            ServiceError::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
            ServiceError::EmptyResponse => write!(f, "empty response"),
            ServiceError::Config(msg) => write!(f, "not configured: {}", msg),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ServiceError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => ServiceError::Transport(err.to_string()),
        }
    }
}

/// Turn a non-success response into `ServiceError::Http`, keeping the body
/// text as the message.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ServiceError::Http {
        status: status.as_u16(),
        message,
    })
}

/// Run a service future with a deadline.
pub async fn with_timeout<T, F>(deadline: Duration, call: F) -> Result<T, ServiceError>
where
    F: std::future::Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout(deadline)),
    }
}

/// Speech-to-text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a WAV container. Providers that signal "no speech" by
    /// omitting the text return `Ok("")`.
    async fn transcribe(&self, wav: Vec<u8>, format: &AudioFormat) -> Result<String, ServiceError>;
}

/// Reply generation.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Produce a reply to `latest`; `history` already ends with it.
    async fn respond(
        &self,
        history: &ConversationHistory,
        latest: &str,
    ) -> Result<String, ServiceError>;
}

/// Voice and output encoding for synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSpec {
    pub voice_id: String,
    pub model_id: String,
    /// Provider format id, e.g. `ulaw_8000`
    pub output_format: String,
}

impl VoiceSpec {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            voice_id: config.speech.voice_id.clone(),
            model_id: config.speech.tts_model.clone(),
            output_format: config.speech.output_format.clone(),
        }
    }
}

/// Text-to-speech.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` as raw audio in `voice.output_format`.
    async fn synthesize(&self, text: &str, voice: &VoiceSpec) -> Result<Vec<u8>, ServiceError>;
}

/// Process-wide service handles injected into every call's pipeline.
#[derive(Clone)]
pub struct ServiceHandles {
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn Responder>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl ServiceHandles {
    /// Build the production clients from configuration.
    ///
    /// One HTTP client (and connection pool) is shared by all providers.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        let speech = Arc::new(elevenlabs::ElevenLabsClient::new(http.clone(), &config.speech));
        let responder = Arc::new(gemini::GeminiResponder::new(http, &config.reasoning));

        Ok(Self {
            transcriber: speech.clone(),
            responder,
            synthesizer: speech,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ServiceError>("late")
        };
        let result = with_timeout(Duration::from_millis(10), slow).await;
        assert_eq!(result, Err(ServiceError::Timeout(Duration::from_millis(10))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_results_through() {
        let fast = async { Err::<(), _>(ServiceError::EmptyResponse) };
        assert_eq!(
            with_timeout(Duration::from_secs(1), fast).await,
            Err(ServiceError::EmptyResponse)
        );
    }

    #[test]
    fn test_error_display() {
        let err = ServiceError::Http {
            status: 401,
            message: "invalid api key".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 401: invalid api key");
        assert_eq!(
            ServiceError::Timeout(Duration::from_millis(1500)).to_string(),
            "timed out after 1500ms"
        );
    }
}
