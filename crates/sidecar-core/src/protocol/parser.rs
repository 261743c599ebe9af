//! NDJSON parser for the agent backend's stdout.
//!
//! Tolerant reader: unknown fields are ignored, unknown types that still
//! carry `content` or `text` become info-level text, anything else is
//! returned as [`BackendMessage::Unknown`] for the caller to log.

use serde_json::Value;

use super::backend::BackendMessage;
use super::events::{AgentEvent, EVENT_TYPES};
use crate::error::{Error, Result};

/// Parse a single NDJSON line from backend stdout.
pub fn parse_line(line: &str) -> Result<BackendMessage> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a backend message.
pub fn parse_value(raw: &Value) -> Result<BackendMessage> {
    let msg_type = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::ProtocolParse("Missing 'type' field".into()))?;

    match msg_type {
        "turn_complete" => Ok(BackendMessage::TurnComplete {
            turn_id: raw.get("turn_id").and_then(Value::as_u64),
            output: raw
                .get("output")
                .and_then(|v| v.as_str())
                .map(String::from),
        }),
        "turn_failed" => Ok(BackendMessage::TurnFailed {
            turn_id: raw.get("turn_id").and_then(Value::as_u64),
            message: raw
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Agent turn failed")
                .to_string(),
        }),
        t if EVENT_TYPES.contains(&t) => serde_json::from_value::<AgentEvent>(raw.clone())
            .map(BackendMessage::Event)
            .map_err(|e| Error::ProtocolParse(format!("Malformed '{t}' event: {e}"))),
        other => Ok(parse_fallback(other, raw)),
    }
}

fn parse_fallback(msg_type: &str, raw: &Value) -> BackendMessage {
    let content = raw
        .get("content")
        .and_then(|v| v.as_str())
        .or_else(|| raw.get("text").and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty());
    match content {
        Some(text) => BackendMessage::Event(AgentEvent::info(text)),
        None => BackendMessage::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::events::MessageLevel;

    #[test]
    fn parses_known_event() {
        let msg = parse_line(r#"{"type":"text","text":"building","level":"warning","extra":1}"#)
            .unwrap();
        assert_eq!(
            msg,
            BackendMessage::Event(AgentEvent::Text {
                text: "building".into(),
                level: MessageLevel::Warning,
            })
        );
    }

    #[test]
    fn parses_turn_markers() {
        assert_eq!(
            parse_line(r#"{"type":"turn_complete","turn_id":3,"output":"done"}"#).unwrap(),
            BackendMessage::TurnComplete {
                turn_id: Some(3),
                output: Some("done".into()),
            }
        );
        let BackendMessage::TurnFailed { message, turn_id } =
            parse_line(r#"{"type":"turn_failed"}"#).unwrap()
        else {
            panic!("expected turn_failed");
        };
        assert_eq!(turn_id, None);
        assert_eq!(message, "Agent turn failed");
    }

    #[test]
    fn unknown_with_content_becomes_text() {
        let msg = parse_line(r#"{"type":"banner","content":"hello"}"#).unwrap();
        assert_eq!(msg, BackendMessage::Event(AgentEvent::info("hello")));
    }

    #[test]
    fn unknown_without_content_is_preserved() {
        let msg = parse_line(r#"{"type":"heartbeat","seq":4}"#).unwrap();
        let BackendMessage::Unknown { msg_type, payload } = msg else {
            panic!("expected unknown");
        };
        assert_eq!(msg_type, "heartbeat");
        assert_eq!(payload["seq"], 4);
    }

    #[test]
    fn malformed_known_event_is_an_error() {
        assert!(parse_line(r#"{"type":"diff"}"#).is_err());
        assert!(parse_line(r#"{"no_type":true}"#).is_err());
        assert!(parse_line("not json").is_err());
    }
}
