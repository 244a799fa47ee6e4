//! # Twilio Call Control
//!
//! Outbound call creation through the REST API, and the TwiML document that
//! tells Twilio to greet the callee and then open a media stream to `/ws`.

use super::{check_status, ServiceError};
use crate::config::TelephonyConfig;

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

/// Starts outbound calls. Faked in handler tests.
#[async_trait]
pub trait CallLauncher: Send + Sync {
    /// Dial `to` and return the provider's call SID.
    async fn create_call(&self, to: &str) -> Result<String, ServiceError>;
}

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
}

pub struct TwilioClient {
    http: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
    twiml_url: String,
    timeout: Duration,
}

impl TwilioClient {
    pub fn new(http: reqwest::Client, config: &TelephonyConfig) -> Self {
        Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
            twiml_url: format!("{}/twiml", config.public_http_url.trim_end_matches('/')),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    pub fn calls_url(&self) -> String {
        format!("{}/Accounts/{}/Calls.json", self.api_base, self.account_sid)
    }
}

#[async_trait]
impl CallLauncher for TwilioClient {
    async fn create_call(&self, to: &str) -> Result<String, ServiceError> {
        if self.account_sid.is_empty() || self.auth_token.is_empty() {
            return Err(ServiceError::Config("Twilio credentials are not set".to_string()));
        }
        if self.from_number.is_empty() {
            return Err(ServiceError::Config("Twilio caller number is not set".to_string()));
        }

        let response = self
            .http
            .post(self.calls_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", to),
                ("From", self.from_number.as_str()),
                ("Url", self.twiml_url.as_str()),
            ])
            .timeout(self.timeout)
            .send()
            .await?;
        let call: CallResource = check_status(response).await?.json().await?;

        info!(call_sid = %call.sid, to, "Started outbound call");
        Ok(call.sid)
    }
}

/// Media stream URL as Twilio requires it (secure schemes only).
pub fn secure_stream_url(url: &str) -> String {
    url.replacen("ws://", "wss://", 1)
        .replacen("http://", "https://", 1)
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Render the call markup: greeting, pause, second message, then a
/// bidirectional media stream. Nothing may follow `<Connect>`.
pub fn render_twiml(config: &TelephonyConfig) -> String {
    let stream_url = secure_stream_url(&config.public_ws_url);
    let status_url = format!(
        "{}/stream/status",
        config.public_http_url.trim_end_matches('/')
    );

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            "<Response>",
            "<Say>{greeting}</Say>",
            r#"<Pause length="{pause}"/>"#,
            "<Say>{connecting}</Say>",
            "<Connect>",
            r#"<Stream url="{url}" statusCallback="{status}" statusCallbackMethod="POST"/>"#,
            "</Connect>",
            "</Response>"
        ),
        greeting = escape_xml(&config.greeting),
        pause = config.pause_seconds,
        connecting = escape_xml(&config.connecting_message),
        url = escape_xml(&stream_url),
        status = escape_xml(&status_url),
    )
}
