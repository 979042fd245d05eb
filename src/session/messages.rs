//! Relay wire messages as closed tagged unions.
//!
//! Every JSON message carries a `type` discriminator.  Inbound messages are
//! parsed into [`InboundMessage`] and matched exhaustively; outbound control
//! messages are [`ControlMessage`]s, and capture audio travels as raw binary
//! frames alongside them ([`OutboundMessage::Audio`]).
//!
//! ```rust
//! use voice_duplex::session::InboundMessage;
//!
//! let msg = InboundMessage::from_json(
//!     r#"{"type":"audio_chunk","contextId":"c1","audio":"AAA=","isFinal":true}"#,
//! ).unwrap();
//! assert!(matches!(msg, InboundMessage::AudioChunk { is_final: true, .. }));
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::playback::{ContextId, InboundFragment};

// ---------------------------------------------------------------------------
// MessageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

// ---------------------------------------------------------------------------
// InboundMessage
// ---------------------------------------------------------------------------

/// Everything the relay can send us.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    SessionCreated {
        session_id: String,
    },
    SessionJoined {
        session_id: String,
    },
    /// Interim transcription of the user's current utterance.
    PartialTranscript {
        #[serde(alias = "transcript")]
        text: String,
    },
    /// The user's turn is over.
    #[serde(alias = "transcription_complete")]
    FinalTranscript {
        #[serde(alias = "transcript")]
        text: String,
    },
    /// One streamed token of the assistant's text response.
    ResponseToken {
        token: String,
    },
    /// One synthesized audio fragment.
    AudioChunk {
        #[serde(rename = "contextId", alias = "context_id")]
        context_id: ContextId,
        /// Base64 payload.
        #[serde(alias = "audio_data")]
        audio: String,
        #[serde(rename = "isFinal", alias = "final", alias = "is_final", default)]
        is_final: bool,
    },
    /// Stop playing a context (the active one when absent).
    ClearContext {
        #[serde(default, alias = "contextId")]
        context_id: Option<ContextId>,
    },
    Error {
        message: String,
    },
}

impl InboundMessage {
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode an `audio_chunk` into a fragment; `None` for other messages.
    pub fn into_fragment(self) -> Option<Result<InboundFragment, MessageError>> {
        match self {
            Self::AudioChunk {
                context_id,
                audio,
                is_final,
            } => Some(
                STANDARD
                    .decode(audio.as_bytes())
                    .map(|payload| InboundFragment::new(context_id, payload, is_final))
                    .map_err(MessageError::from),
            ),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ControlMessage / OutboundMessage
// ---------------------------------------------------------------------------

/// JSON control messages we send to the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    SessionCreate,
    SessionJoin {
        session_id: String,
    },
    /// Binary capture frames follow at this format.
    StartCapture {
        sample_rate: u32,
        frame_samples: usize,
    },
    StopCapture,
    /// The user finished speaking (explicit end of turn).
    TurnEnd,
    /// Playback was interrupted locally; stop synthesizing the context.
    Interrupt {
        #[serde(skip_serializing_if = "Option::is_none")]
        context_id: Option<ContextId>,
    },
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One frame for the relay writer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Control(ControlMessage),
    /// 16-bit little-endian mono PCM capture frame.
    Audio(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn parse(value: Value) -> InboundMessage {
        InboundMessage::from_json(&value.to_string()).expect("valid message")
    }

    #[test]
    fn parses_audio_chunk_with_camel_case_fields() {
        let msg = parse(json!({
            "type": "audio_chunk",
            "contextId": "ctx-7",
            "audio": STANDARD.encode([1u8, 2, 3]),
            "isFinal": false,
        }));
        let fragment = msg.into_fragment().unwrap().unwrap();
        assert_eq!(fragment.context_id.as_str(), "ctx-7");
        assert_eq!(fragment.payload, vec![1, 2, 3]);
        assert!(!fragment.is_final);
    }

    #[test]
    fn audio_chunk_accepts_snake_case_and_defaults_final() {
        let msg = parse(json!({
            "type": "audio_chunk",
            "context_id": "a",
            "audio_data": "",
        }));
        assert_eq!(
            msg,
            InboundMessage::AudioChunk {
                context_id: "a".into(),
                audio: String::new(),
                is_final: false,
            }
        );

        let msg = parse(json!({"type": "audio_chunk", "context_id": "a", "audio": "", "final": true}));
        assert!(matches!(msg, InboundMessage::AudioChunk { is_final: true, .. }));
    }

    #[test]
    fn bad_base64_is_an_error() {
        let msg = parse(json!({"type": "audio_chunk", "contextId": "a", "audio": "@@@"}));
        assert!(matches!(
            msg.into_fragment(),
            Some(Err(MessageError::Base64(_)))
        ));
    }

    #[test]
    fn non_audio_has_no_fragment() {
        let msg = parse(json!({"type": "response_token", "token": "hi"}));
        assert!(msg.into_fragment().is_none());
    }

    #[test]
    fn transcript_aliases() {
        assert_eq!(
            parse(json!({"type": "transcription_complete", "transcript": "hello"})),
            InboundMessage::FinalTranscript {
                text: "hello".into()
            }
        );
        assert_eq!(
            parse(json!({"type": "partial_transcript", "text": "hel"})),
            InboundMessage::PartialTranscript { text: "hel".into() }
        );
    }

    #[test]
    fn clear_context_id_is_optional() {
        assert_eq!(
            parse(json!({"type": "clear_context"})),
            InboundMessage::ClearContext { context_id: None }
        );
        assert_eq!(
            parse(json!({"type": "clear_context", "contextId": "x"})),
            InboundMessage::ClearContext {
                context_id: Some("x".into())
            }
        );
    }

    #[test]
    fn session_messages() {
        assert_eq!(
            parse(json!({"type": "session_created", "session_id": "s1"})),
            InboundMessage::SessionCreated {
                session_id: "s1".into()
            }
        );
        assert_eq!(
            parse(json!({"type": "error", "message": "boom"})),
            InboundMessage::Error {
                message: "boom".into()
            }
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            InboundMessage::from_json(r#"{"type":"telemetry"}"#),
            Err(MessageError::Json(_))
        ));
        assert!(InboundMessage::from_json("not json").is_err());
    }

    #[test]
    fn control_messages_serialize_with_type_tag() {
        let to_value = |m: ControlMessage| -> Value {
            serde_json::from_str(&m.to_json().unwrap()).unwrap()
        };
        assert_eq!(to_value(ControlMessage::SessionCreate), json!({"type": "session_create"}));
        assert_eq!(
            to_value(ControlMessage::SessionJoin {
                session_id: "s1".into()
            }),
            json!({"type": "session_join", "session_id": "s1"})
        );
        assert_eq!(
            to_value(ControlMessage::StartCapture {
                sample_rate: 16_000,
                frame_samples: 1_600
            }),
            json!({"type": "start_capture", "sample_rate": 16000, "frame_samples": 1600})
        );
        assert_eq!(to_value(ControlMessage::TurnEnd), json!({"type": "turn_end"}));
        assert_eq!(
            to_value(ControlMessage::Interrupt {
                context_id: Some("c".into())
            }),
            json!({"type": "interrupt", "context_id": "c"})
        );
        assert_eq!(
            to_value(ControlMessage::Interrupt { context_id: None }),
            json!({"type": "interrupt"})
        );
    }
}
