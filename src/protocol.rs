//! # Media Stream Wire Protocol
//!
//! JSON text frames exchanged with the telephony media stream. Every frame
//! carries an `event` field that selects the variant.
//!
//! ## Inbound Events:
//! - `connected`: transport handshake, logged only
//! - `start`: assigns the stream SID and announces the media format
//! - `media`: one base64 chunk of μ-law caller audio
//! - `mark`: playback marker echoed back by the transport
//! - `stop`: the stream has ended
//!
//! ## Outbound Messages:
//! - `media`: base64 μ-law audio addressed to a stream
//! - `mark`: a named marker queued after the audio
//!
//! Unknown fields are ignored so newer transport versions keep parsing.

use crate::audio::AudioFormat;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Raw inbound frame as it appears on the wire.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundFrame {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
    Start {
        start: StartPayload,
    },
    Media {
        media: MediaPayload,
    },
    Stop {},
    Mark {
        mark: MarkPayload,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload {
    stream_sid: String,
    #[serde(default)]
    call_sid: Option<String>,
    #[serde(default)]
    custom_parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    media_format: Option<MediaFormatPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaFormatPayload {
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    sample_rate: Option<u32>,
    #[serde(default)]
    channels: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
    #[serde(default)]
    track: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarkPayload {
    name: String,
}

/// Data carried by a start event.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStart {
    pub stream_sid: String,
    pub call_sid: Option<String>,
    pub custom_parameters: HashMap<String, String>,
    pub format: AudioFormat,
}

/// A parsed inbound event with its media payload already decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Connected { protocol: Option<String> },
    Start(StreamStart),
    Media { payload: Vec<u8>, track: Option<String> },
    Stop,
    Mark { name: String },
}

/// Inbound frame that could not be turned into a `MediaEvent`.
#[derive(Debug)]
pub enum ProtocolError {
    /// Not JSON, unknown event, or missing required fields
    Malformed(serde_json::Error),
    /// Media payload was not valid base64
    Payload(base64::DecodeError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(err) => write!(f, "malformed event: {}", err),
            ProtocolError::Payload(err) => write!(f, "invalid media payload: {}", err),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err)
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::Payload(err)
    }
}

/// Parse one inbound text frame.
///
/// ## Defaults:
/// A start event without `mediaFormat` (or with missing fields) falls back
/// to 8kHz mono μ-law. Non-string custom parameter values keep their JSON
/// text form.
pub fn parse_event(text: &str) -> Result<MediaEvent, ProtocolError> {
    let event = match serde_json::from_str::<InboundFrame>(text)? {
        InboundFrame::Connected { protocol, version } => {
            tracing::trace!(?protocol, ?version, "Handshake frame");
            MediaEvent::Connected { protocol }
        }
        InboundFrame::Start { start } => {
            let defaults = AudioFormat::default();
            let format = match start.media_format {
                Some(f) => AudioFormat {
                    encoding: f.encoding.unwrap_or(defaults.encoding),
                    sample_rate: f.sample_rate.filter(|r| *r > 0).unwrap_or(defaults.sample_rate),
                    channels: f.channels.filter(|c| *c > 0).unwrap_or(defaults.channels),
                },
                None => defaults,
            };
            let custom_parameters = start
                .custom_parameters
                .into_iter()
                .map(|(key, value)| match value {
                    serde_json::Value::String(s) => (key, s),
                    other => (key, other.to_string()),
                })
                .collect();

            MediaEvent::Start(StreamStart {
                stream_sid: start.stream_sid,
                call_sid: start.call_sid,
                custom_parameters,
                format,
            })
        }
        InboundFrame::Media { media } => MediaEvent::Media {
            payload: STANDARD.decode(media.payload.as_bytes())?,
            track: media.track,
        },
        InboundFrame::Stop {} => MediaEvent::Stop,
        InboundFrame::Mark { mark } => MediaEvent::Mark { name: mark.name },
    };
    Ok(event)
}

/// Outbound frame sent to the transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: OutboundMark,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    /// Base64 μ-law audio
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMark {
    pub name: String,
}

impl OutboundMessage {
    /// Wrap egress-codec audio for one stream.
    pub fn media(stream_sid: &str, audio: &[u8]) -> Self {
        OutboundMessage::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia {
                payload: STANDARD.encode(audio),
            },
        }
    }

    pub fn mark(stream_sid: &str, name: &str) -> Self {
        OutboundMessage::Mark {
            stream_sid: stream_sid.to_string(),
            mark: OutboundMark {
                name: name.to_string(),
            },
        }
    }

    /// Serialize to the JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start_with_format() {
        let frame = json!({
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "streamSid": "MZ18ad3ab5a668481ce02b83e7395059f0",
                "callSid": "CA123",
                "tracks": ["inbound"],
                "customParameters": {"campaign": "recharge", "attempt": 2},
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            },
            "streamSid": "MZ18ad3ab5a668481ce02b83e7395059f0"
        });

        match parse_event(&frame.to_string()).unwrap() {
            MediaEvent::Start(start) => {
                assert_eq!(start.stream_sid, "MZ18ad3ab5a668481ce02b83e7395059f0");
                assert_eq!(start.call_sid.as_deref(), Some("CA123"));
                assert_eq!(start.custom_parameters["campaign"], "recharge");
                assert_eq!(start.custom_parameters["attempt"], "2");
                assert_eq!(start.format, AudioFormat::default());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_start_without_format_uses_defaults() {
        let frame = r#"{"event":"start","start":{"streamSid":"MZ1"}}"#;
        match parse_event(frame).unwrap() {
            MediaEvent::Start(start) => {
                assert_eq!(start.format.sample_rate, 8000);
                assert_eq!(start.format.channels, 1);
                assert!(start.custom_parameters.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_media_decodes_payload() {
        let frame = r#"{"event":"media","media":{"track":"inbound","chunk":"2","timestamp":"5","payload":"/w=="}}"#;
        assert_eq!(
            parse_event(frame).unwrap(),
            MediaEvent::Media {
                payload: vec![0xFF],
                track: Some("inbound".to_string())
            }
        );
    }

    #[test]
    fn test_parse_control_events() {
        assert_eq!(parse_event(r#"{"event":"stop"}"#).unwrap(), MediaEvent::Stop);
        assert_eq!(
            parse_event(r#"{"event":"stop","stop":{"callSid":"CA1"}}"#).unwrap(),
            MediaEvent::Stop
        );
        assert_eq!(
            parse_event(r#"{"event":"mark","mark":{"name":"response-complete-3"}}"#).unwrap(),
            MediaEvent::Mark {
                name: "response-complete-3".to_string()
            }
        );
        assert_eq!(
            parse_event(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#).unwrap(),
            MediaEvent::Connected {
                protocol: Some("Call".to_string())
            }
        );
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(matches!(parse_event("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            parse_event(r#"{"event":"dtmf","dtmf":{"digit":"1"}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            parse_event(r#"{"event":"media","media":{"payload":"***"}}"#),
            Err(ProtocolError::Payload(_))
        ));
    }

    #[test]
    fn test_outbound_shapes() {
        let media = OutboundMessage::media("MZ1", &[0xFF, 0x7F]);
        assert_eq!(
            serde_json::to_value(&media).unwrap(),
            json!({"event": "media", "streamSid": "MZ1", "media": {"payload": "/38="}})
        );

        let mark = OutboundMessage::mark("MZ1", "response-complete-1");
        assert_eq!(
            serde_json::to_value(&mark).unwrap(),
            json!({"event": "mark", "streamSid": "MZ1", "mark": {"name": "response-complete-1"}})
        );
    }
}
