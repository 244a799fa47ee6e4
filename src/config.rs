//! # Configuration Management
//!
//! Loads the service configuration from layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml, optional)
//! - Environment variables (with `APP__` prefix and `__` separators)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Well-known deployment variables (`PORT`, `ELEVENLABS_API_KEY`, `TWILIO_*`, ...)
//! 2. Prefixed environment variables (`APP__AUDIO__TURN_DURATION_MS=1500`)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: bind address
//! - **audio**: turn segmentation, history bound and output pacing
//! - **speech**: speech-to-text and text-to-speech provider settings
//! - **reasoning**: reply generation provider settings
//! - **fallback**: fixed texts used when a stage fails
//! - **telephony**: call initiation credentials and public URLs
//! - **performance**: connection limits and timers

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub speech: SpeechConfig,
    pub reasoning: ReasoningConfig,
    pub fallback: FallbackConfig,
    pub telephony: TelephonyConfig,
    pub performance: PerformanceConfig,
}

/// Server bind settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any address (behind a tunnel or proxy)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Turn segmentation and session settings.
///
/// ## Byte thresholds:
/// Durations are converted to PCM16 byte counts at the negotiated sample
/// rate. At 8kHz mono, 2000ms is 32,000 bytes and 500ms is 8,000 bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate assumed until a start event announces one
    pub sample_rate: u32,

    /// Buffered audio that completes a turn
    pub turn_duration_ms: u32,

    /// Shortest turn worth transcribing
    pub min_turn_ms: u32,

    /// Shortest transcript (after trimming) that counts as speech
    pub min_transcript_chars: usize,

    /// Dialogue entries kept per call
    pub history_limit: usize,

    /// Split replies into real-time frames instead of one message
    pub paced_output: bool,

    /// Frame duration used when `paced_output` is on
    pub frame_ms: u32,
}

/// ElevenLabs speech settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub api_base: String,

    /// Sent as `xi-api-key`; empty means unconfigured
    pub api_key: String,

    pub stt_model: String,

    /// Retried once when the primary model returns an HTTP error
    pub stt_fallback_model: String,

    pub voice_id: String,
    pub tts_model: String,

    /// Must match the media stream codec (`ulaw_8000` for 8kHz μ-law)
    pub output_format: String,

    pub stt_timeout_ms: u64,
    pub tts_timeout_ms: u64,
}

/// Gemini reply generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,

    /// Instructions placed ahead of the dialogue in every request
    pub persona: String,

    pub timeout_ms: u64,
}

/// Texts substituted when a stage fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Used when reply generation fails or returns nothing
    pub reply: String,

    /// Spoken once when synthesis or delivery of the reply fails
    pub utterance: String,
}

/// Twilio call initiation and markup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    pub api_base: String,
    pub account_sid: String,
    pub auth_token: String,

    /// Caller ID for outbound calls
    pub from_number: String,

    /// Public base URL of this service, used for markup and status callbacks
    pub public_http_url: String,

    /// Public URL of the media stream endpoint
    pub public_ws_url: String,

    pub greeting: String,
    pub connecting_message: String,
    pub pause_seconds: u32,
    pub timeout_ms: u64,
}

/// Limits and timers for media stream connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// New streams beyond this are refused with 503
    pub max_concurrent_calls: usize,

    /// WebSocket ping interval
    pub heartbeat_interval_secs: u64,

    /// Connections with no inbound traffic for this long are closed
    pub idle_timeout_secs: u64,

    /// Interval of the per-call summary log line
    pub summary_interval_secs: u64,

    /// Largest accepted inbound WebSocket frame
    pub max_frame_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3001,
            },
            audio: AudioConfig {
                sample_rate: 8000,
                turn_duration_ms: 2000,
                min_turn_ms: 500,
                min_transcript_chars: 3,
                history_limit: 12,
                paced_output: false,
                frame_ms: 20,
            },
            speech: SpeechConfig {
                api_base: "https://api.elevenlabs.io".to_string(),
                api_key: String::new(),
                stt_model: "scribe_v1".to_string(),
                stt_fallback_model: "scribe_v1_experimental".to_string(),
                voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
                tts_model: "eleven_flash_v2_5".to_string(),
                output_format: "ulaw_8000".to_string(),
                stt_timeout_ms: 15_000,
                tts_timeout_ms: 15_000,
            },
            reasoning: ReasoningConfig {
                api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                api_key: String::new(),
                model: "gemini-2.5-flash".to_string(),
                persona: DEFAULT_PERSONA.to_string(),
                timeout_ms: 10_000,
            },
            fallback: FallbackConfig {
                reply: "I apologize for the technical issue. Let me tell you about our special \
                        recharge offer today. We're giving 20% extra balance and free data for \
                        7 days. Are you interested?"
                    .to_string(),
                utterance: "I'm having trouble with my voice. Let me continue with our conversation."
                    .to_string(),
            },
            telephony: TelephonyConfig {
                api_base: "https://api.twilio.com/2010-04-01".to_string(),
                account_sid: String::new(),
                auth_token: String::new(),
                from_number: String::new(),
                public_http_url: "http://localhost:3001".to_string(),
                public_ws_url: "ws://localhost:3001/ws".to_string(),
                greeting: "Hello!".to_string(),
                connecting_message: "Connecting you to our A I assistant...".to_string(),
                pause_seconds: 1,
                timeout_ms: 10_000,
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 50,
                heartbeat_interval_secs: 30,
                idle_timeout_secs: 60,
                summary_interval_secs: 30,
                max_frame_bytes: 1024 * 1024, // 1MB
            },
        }
    }
}

const DEFAULT_PERSONA: &str = "You are a professional telecom sales agent calling customers to \
offer recharge bonuses. Your goal is to convince them to recharge their SIM card. Be friendly, \
persuasive, and address their concerns naturally. Respond naturally as if you're having a real \
conversation. Keep responses under 2 sentences. Be persuasive but not pushy. Focus on telecom \
recharge offers, bonuses, and special deals and give response in english.";

/// Deployment variables that map straight onto config keys.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("ELEVENLABS_API_KEY", "speech.api_key"),
    ("GEMINI_API_KEY", "reasoning.api_key"),
    ("TWILIO_ACCOUNT_SID", "telephony.account_sid"),
    ("TWILIO_AUTH_TOKEN", "telephony.auth_token"),
    ("TWILIO_NUMBER", "telephony.from_number"),
    ("PUBLIC_HTTP_URL", "telephony.public_http_url"),
    ("PUBLIC_WS_URL", "telephony.public_ws_url"),
];

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP__AUDIO__PACED_OUTPUT=true`: Send replies frame by frame
    /// - `PORT=3000`: Special case for deployment platforms
    /// - `GEMINI_API_KEY=...`: Provider keys under their usual names
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        for (var, key) in ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                if !value.is_empty() {
                    settings = settings.set_override(*key, value)?;
                }
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Missing provider keys are not errors here; the affected stage fails
    /// at call time and takes its fallback path.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.turn_duration_ms == 0 {
            return Err(anyhow::anyhow!("Turn duration must be greater than 0"));
        }

        if self.audio.min_turn_ms > self.audio.turn_duration_ms {
            return Err(anyhow::anyhow!(
                "Minimum turn duration ({}ms) cannot exceed the turn duration ({}ms)",
                self.audio.min_turn_ms,
                self.audio.turn_duration_ms
            ));
        }

        if self.audio.history_limit == 0 {
            return Err(anyhow::anyhow!("History limit must be greater than 0"));
        }

        if self.audio.frame_ms == 0 {
            return Err(anyhow::anyhow!("Frame duration must be greater than 0"));
        }

        if self.speech.stt_timeout_ms == 0
            || self.speech.tts_timeout_ms == 0
            || self.reasoning.timeout_ms == 0
        {
            return Err(anyhow::anyhow!("Service timeouts must be greater than 0"));
        }

        if self.fallback.reply.trim().is_empty() || self.fallback.utterance.trim().is_empty() {
            return Err(anyhow::anyhow!("Fallback texts cannot be empty"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0 || self.performance.idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat and idle timeout must be greater than 0"));
        }

        if self.performance.summary_interval_secs == 0 {
            return Err(anyhow::anyhow!("Summary interval must be greater than 0"));
        }

        if self.performance.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update (used by `PUT /api/v1/config`).
    ///
    /// Only runtime-tunable fields are accepted. Bind address changes take
    /// effect on restart; audio and fallback changes apply to calls that
    /// start after the update. The update is validated before it is kept.
    ///
    /// ## Example:
    /// `{"audio": {"turn_duration_ms": 1500}, "fallback": {"reply": "..."}}`
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                updated.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                updated.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Port {} is out of range", port))?;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(v) = audio.get("turn_duration_ms").and_then(|v| v.as_u64()) {
                updated.audio.turn_duration_ms = narrow("audio.turn_duration_ms", v)?;
            }
            if let Some(v) = audio.get("min_turn_ms").and_then(|v| v.as_u64()) {
                updated.audio.min_turn_ms = narrow("audio.min_turn_ms", v)?;
            }
            if let Some(v) = audio.get("min_transcript_chars").and_then(|v| v.as_u64()) {
                updated.audio.min_transcript_chars = narrow("audio.min_transcript_chars", v)?;
            }
            if let Some(v) = audio.get("history_limit").and_then(|v| v.as_u64()) {
                updated.audio.history_limit = narrow("audio.history_limit", v)?;
            }
            if let Some(v) = audio.get("paced_output").and_then(|v| v.as_bool()) {
                updated.audio.paced_output = v;
            }
            if let Some(v) = audio.get("frame_ms").and_then(|v| v.as_u64()) {
                updated.audio.frame_ms = narrow("audio.frame_ms", v)?;
            }
        }

        if let Some(fallback) = partial.get("fallback") {
            if let Some(v) = fallback.get("reply").and_then(|v| v.as_str()) {
                updated.fallback.reply = v.to_string();
            }
            if let Some(v) = fallback.get("utterance").and_then(|v| v.as_str()) {
                updated.fallback.utterance = v.to_string();
            }
        }

        if let Some(reasoning) = partial.get("reasoning") {
            if let Some(v) = reasoning.get("persona").and_then(|v| v.as_str()) {
                updated.reasoning.persona = v.to_string();
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(v) = performance.get("max_concurrent_calls").and_then(|v| v.as_u64()) {
                updated.performance.max_concurrent_calls = narrow("performance.max_concurrent_calls", v)?;
            }
            if let Some(v) = performance.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                updated.performance.idle_timeout_secs = v;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn narrow<T: TryFrom<u64>>(field: &str, value: u64) -> Result<T> {
    T::try_from(value).map_err(|_| anyhow::anyhow!("{} value {} is out of range", field, value))
}

impl AudioConfig {
    /// Format assumed for a stream until its start event arrives.
    pub fn default_format(&self) -> crate::audio::AudioFormat {
        crate::audio::AudioFormat::mulaw(self.sample_rate, 1)
    }
}

impl SpeechConfig {
    pub fn stt_timeout(&self) -> Duration {
        Duration::from_millis(self.stt_timeout_ms)
    }

    pub fn tts_timeout(&self) -> Duration {
        Duration::from_millis(self.tts_timeout_ms)
    }
}

impl ReasoningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration view exposed by `GET /api/v1/config` with secrets masked.
pub fn redacted(config: &AppConfig) -> AppConfig {
    fn mask(secret: &mut String) {
        if !secret.is_empty() {
            *secret = "***".to_string();
        }
    }

    let mut view = config.clone();
    mask(&mut view.speech.api_key);
    mask(&mut view.reasoning.api_key);
    mask(&mut view.telephony.auth_token);
    view
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.audio.turn_duration_ms, 2000);
        assert_eq!(config.audio.history_limit, 12);
        assert_eq!(config.speech.output_format, "ulaw_8000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_thresholds_at_8khz() {
        let config = AppConfig::default();
        let format = config.audio.default_format();
        assert_eq!(format.pcm_bytes_for(config.audio.turn_duration_ms), 32000);
        assert_eq!(format.pcm_bytes_for(config.audio.min_turn_ms), 8000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.min_turn_ms = 5000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.fallback.reply = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_summary_interval_and_frame_size_rejected() {
        let mut config = AppConfig::default();
        config.performance.summary_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.max_frame_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"turn_duration_ms": 1500, "paced_output": true}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.audio.turn_duration_ms, 1500);
        assert!(config.audio.paced_output);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"turn_duration_ms": 1000, "history_limit": 0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.audio.turn_duration_ms, 2000);
        assert_eq!(config.audio.history_limit, 12);
    }

    #[test]
    fn test_out_of_range_update_is_rejected() {
        let mut config = AppConfig::default();
        // 2^32 + 1 would wrap to 1 if narrowed with `as`
        let json = r#"{"audio": {"turn_duration_ms": 4294967297}}"#;
        let err = config.update_from_json(json).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert_eq!(config.audio.turn_duration_ms, 2000);

        let json = r#"{"audio": {"frame_ms": 4294967316}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.audio.frame_ms, 20);
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut config = AppConfig::default();
        config.speech.api_key = "xi-secret".to_string();
        let view = redacted(&config);
        assert_eq!(view.speech.api_key, "***");
        assert_eq!(view.reasoning.api_key, "");
    }
}
