//! Google Gemini reply generation.
//!
//! Each request is a single user turn containing the persona instructions,
//! the rendered dialogue and the caller's latest utterance.

use super::{check_status, Responder, ServiceError};
use crate::audio::ConversationHistory;
use crate::config::ReasoningConfig;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    /// Text of the first candidate's first part, if any.
    fn into_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .find_map(|part| part.text)
    }
}

pub struct GeminiResponder {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    persona: String,
}

impl GeminiResponder {
    pub fn new(http: reqwest::Client, config: &ReasoningConfig) -> Self {
        Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            persona: config.persona.clone(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    /// Assemble the prompt text for one request.
    pub fn build_prompt(&self, history: &ConversationHistory, latest: &str) -> String {
        format!(
            "{}\n\nCurrent conversation:\n{}\n\nUser just said: \"{}\"",
            self.persona.trim(),
            history.render(),
            latest
        )
    }
}

#[async_trait]
impl Responder for GeminiResponder {
    async fn respond(
        &self,
        history: &ConversationHistory,
        latest: &str,
    ) -> Result<String, ServiceError> {
        if self.api_key.is_empty() {
            return Err(ServiceError::Config("Gemini API key is not set".to_string()));
        }

        let prompt = self.build_prompt(history, latest);
        debug!(model = %self.model, history_len = history.len(), "Requesting reply");

        let response = self
            .http
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&json!({
                "contents": [{"role": "user", "parts": [{"text": prompt}]}]
            }))
            .send()
            .await?;
        let body: GenerateResponse = check_status(response).await?.json().await?;

        match body.into_text() {
            Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            _ => Err(ServiceError::EmptyResponse),
        }
    }
}
