//! ElevenLabs speech-to-text and text-to-speech over HTTPS.

use super::{check_status, ServiceError, Synthesizer, Transcriber, VoiceSpec};
use crate::audio::AudioFormat;
use crate::config::SpeechConfig;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct TranscriptResponse {
    #[serde(default)]
    text: Option<String>,
}

/// Shared client for both directions of speech.
pub struct ElevenLabsClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    stt_model: String,
    stt_fallback_model: String,
}

impl ElevenLabsClient {
    pub fn new(http: reqwest::Client, config: &SpeechConfig) -> Self {
        Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            stt_model: config.stt_model.clone(),
            stt_fallback_model: config.stt_fallback_model.clone(),
        }
    }

    fn api_key(&self) -> Result<&str, ServiceError> {
        if self.api_key.is_empty() {
            return Err(ServiceError::Config("ElevenLabs API key is not set".to_string()));
        }
        Ok(&self.api_key)
    }

    pub fn stt_url(&self) -> String {
        format!("{}/v1/speech-to-text", self.api_base)
    }

    pub fn tts_url(&self, voice: &VoiceSpec) -> String {
        format!(
            "{}/v1/text-to-speech/{}?output_format={}",
            self.api_base, voice.voice_id, voice.output_format
        )
    }

    async fn transcribe_with(&self, wav: Vec<u8>, model: &str) -> Result<String, ServiceError> {
        let api_key = self.api_key()?;

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model_id", model.to_string());

        let response = self
            .http
            .post(self.stt_url())
            .header("xi-api-key", api_key)
            .multipart(form)
            .send()
            .await?;
        let body: TranscriptResponse = check_status(response).await?.json().await?;

        Ok(parse_transcript(body))
    }
}

/// A missing `text` field means no speech was recognized.
fn parse_transcript(body: TranscriptResponse) -> String {
    body.text.unwrap_or_default()
}

#[async_trait]
impl Transcriber for ElevenLabsClient {
    async fn transcribe(&self, wav: Vec<u8>, format: &AudioFormat) -> Result<String, ServiceError> {
        debug!(
            model = %self.stt_model,
            wav_bytes = wav.len(),
            sample_rate = format.sample_rate,
            "Sending audio for transcription"
        );

        match self.transcribe_with(wav.clone(), &self.stt_model).await {
            Err(ServiceError::Http { status, message }) => {
                warn!(
                    status,
                    error = %message,
                    fallback_model = %self.stt_fallback_model,
                    "Transcription rejected, retrying with fallback model"
                );
                self.transcribe_with(wav, &self.stt_fallback_model).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsClient {
    async fn synthesize(&self, text: &str, voice: &VoiceSpec) -> Result<Vec<u8>, ServiceError> {
        let api_key = self.api_key()?;
        debug!(
            voice = %voice.voice_id,
            model = %voice.model_id,
            chars = text.len(),
            "Synthesizing reply"
        );

        let response = self
            .http
            .post(self.tts_url(voice))
            .header("xi-api-key", api_key)
            .header("Accept", "audio/basic")
            .json(&serde_json::json!({
                "text": text,
                "model_id": voice.model_id,
            }))
            .send()
            .await?;
        let audio = check_status(response).await?.bytes().await?;

        if audio.is_empty() {
            return Err(ServiceError::EmptyResponse);
        }
        Ok(audio.to_vec())
    }
}
