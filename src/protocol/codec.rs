//! Encode/Decode zwischen Wire-JSON und den Frame-Typen
//!
//! Unbekannte `type`-Werte ergeben `ServerEvent::Unrecognized`, damit neue
//! Protokoll-Frames die Lese-Schleife nicht stören. Kaputtes JSON ergibt
//! einen `DecodeError`, niemals einen Panic.

use super::messages::*;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Malformed JSON frame: {0}")]
    Malformed(String),

    #[error("Frame has no string `type` field")]
    MissingType,

    #[error("Invalid payload for `{kind}`: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to encode `{kind}` frame: {reason}")]
pub struct EncodeError {
    pub kind: &'static str,
    pub reason: String,
}

/// Serialisiert einen ausgehenden Frame
pub fn encode(event: &ClientEvent) -> Result<String, EncodeError> {
    serde_json::to_string(event).map_err(|e| EncodeError {
        kind: event.kind(),
        reason: e.to_string(),
    })
}

/// Dekodiert einen eingehenden Frame
pub fn decode(text: &str) -> Result<ServerEvent, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(DecodeError::MissingType)?
        .to_string();

    let event = match kind.as_str() {
        "session.created" => ServerEvent::SessionCreated {
            session: payload::<SessionPayload>(&kind, value)?.session,
        },
        "session.updated" => ServerEvent::SessionUpdated {
            session: payload::<SessionPayload>(&kind, value)?.session,
        },
        "conversation.item.created" => ServerEvent::ConversationItemCreated {
            item: payload::<ItemPayload>(&kind, value)?.item,
        },
        "response.text.delta" | "response.audio_transcript.delta" => ServerEvent::TextDelta {
            delta: payload::<DeltaPayload>(&kind, value)?.delta,
        },
        "response.text.done" | "response.audio_transcript.done" => ServerEvent::TextDone {
            text: payload::<TextDonePayload>(&kind, value)?.text,
        },
        "response.audio.delta" => ServerEvent::AudioDelta {
            delta: payload::<DeltaPayload>(&kind, value)?.delta,
        },
        "conversation.item.input_audio_transcription.completed" => {
            let p = payload::<TranscriptionPayload>(&kind, value)?;
            ServerEvent::InputTranscriptionCompleted {
                item_id: p.item_id,
                transcript: p.transcript,
            }
        }
        "response.function_call" | "response.function_call_arguments.done" => {
            ServerEvent::FunctionCall(payload::<FunctionCall>(&kind, value)?)
        }
        "error" => {
            let p = payload::<ErrorPayload>(&kind, value)?;
            let info = match (p.error, p.message) {
                (Some(info), _) => info,
                (None, Some(message)) => ErrorInfo {
                    message,
                    ..Default::default()
                },
                (None, None) => ErrorInfo {
                    message: "Unknown error".to_string(),
                    ..Default::default()
                },
            };
            ServerEvent::Error(info)
        }
        _ => ServerEvent::Unrecognized { kind },
    };

    Ok(event)
}

fn payload<T: DeserializeOwned>(kind: &str, value: serde_json::Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;

    #[test]
    fn test_encode_session_update() {
        let settings = SessionSettings {
            instructions: "Be brief".to_string(),
            ..Default::default()
        };
        let json = encode(&ClientEvent::SessionUpdate { session: settings }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["instructions"], "Be brief");
        assert_eq!(value["session"]["voice"], "alloy");
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
    }

    #[test]
    fn test_encode_user_text() {
        let json = encode(&ClientEvent::user_text("Hallo")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "user",
                    "content": [{ "type": "input_text", "text": "Hallo" }]
                }
            })
        );
    }

    #[test]
    fn test_encode_response_and_cancel() {
        assert_eq!(
            encode(&ClientEvent::response()).unwrap(),
            r#"{"type":"response.create"}"#
        );
        assert_eq!(
            encode(&ClientEvent::ResponseCancel).unwrap(),
            r#"{"type":"response.cancel"}"#
        );
    }

    #[test]
    fn test_encode_function_output() {
        let json = encode(&ClientEvent::function_output("call_1", "{\"ok\":true}")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["item"]["type"], "function_call_output");
        assert_eq!(value["item"]["call_id"], "call_1");
    }

    #[test]
    fn test_decode_text_frames() {
        assert_eq!(
            decode(r#"{"type":"response.text.delta","delta":"Hel","response_id":"r1"}"#).unwrap(),
            ServerEvent::TextDelta {
                delta: "Hel".to_string()
            }
        );
        assert_eq!(
            decode(r#"{"type":"response.text.done","text":"Hello"}"#).unwrap(),
            ServerEvent::TextDone {
                text: "Hello".to_string()
            }
        );
        assert_eq!(
            decode(r#"{"type":"response.audio_transcript.done","transcript":"Hi there"}"#)
                .unwrap(),
            ServerEvent::TextDone {
                text: "Hi there".to_string()
            }
        );
    }

    #[test]
    fn test_decode_function_call() {
        let event = decode(
            r#"{"type":"response.function_call_arguments.done","name":"lookup","arguments":"{\"q\":1}","call_id":"c7"}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            ServerEvent::FunctionCall(FunctionCall {
                name: "lookup".to_string(),
                arguments: "{\"q\":1}".to_string(),
                call_id: "c7".to_string(),
            })
        );
    }

    #[test]
    fn test_decode_error_shapes() {
        let nested = decode(r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#)
            .unwrap();
        let flat = decode(r#"{"type":"error","message":"bad"}"#).unwrap();

        match (nested, flat) {
            (ServerEvent::Error(a), ServerEvent::Error(b)) => {
                assert_eq!(a.message, "bad");
                assert_eq!(a.kind.as_deref(), Some("invalid_request_error"));
                assert_eq!(b.message, "bad");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        let event = decode(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::Unrecognized {
                kind: "rate_limits.updated".to_string()
            }
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode("{not json"), Err(DecodeError::Malformed(_))));
        assert_eq!(decode(r#"{"delta":"x"}"#), Err(DecodeError::MissingType));
        assert!(matches!(
            decode(r#"{"type":"response.text.delta"}"#),
            Err(DecodeError::InvalidPayload { .. })
        ));
    }
}
