use serde::Deserialize;
use serde_json::value::RawValue;

use crate::protocol::canonical::{CanonicalEvent, EventKind, OutputItem, ProviderErrorBody};

use super::parse_response_snapshot;

#[derive(Debug, Deserialize)]
struct StreamEventWire {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    delta: Option<serde_json::Value>,
    #[serde(default)]
    item_id: Option<String>,
    #[serde(default)]
    output_index: Option<usize>,
    #[serde(default)]
    item: Option<OutputItem>,
    #[serde(default)]
    response: Option<Box<RawValue>>,
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    obfuscation: Option<String>,
    #[serde(default)]
    error: Option<ProviderErrorBody>,
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Decode one Responses API stream payload.
///
/// Returns `Ok(None)` for well-formed events that carry nothing the
/// translation needs (content part bookkeeping, text `done` echoes).
///
/// # Errors
///
/// Returns the `serde_json` error when the payload is not a JSON event.
pub fn decode_responses_event(payload: &str) -> Result<Option<CanonicalEvent>, serde_json::Error> {
    let wire: StreamEventWire = serde_json::from_str(payload)?;
    let Some(kind) = EventKind::from_responses_type(&wire.kind) else {
        return Ok(None);
    };

    let mut event = CanonicalEvent::new(kind);
    event.item_id = wire.item_id.filter(|id| !id.trim().is_empty());
    event.output_index = wire.output_index;
    event.item = wire.item;
    event.passthrough_token = wire.obfuscation.filter(|token| !token.is_empty());

    match kind {
        EventKind::FunctionCallArgumentsDone => {
            event.delta = wire.arguments.unwrap_or_default();
        }
        _ => {
            if let Some(serde_json::Value::String(delta)) = wire.delta {
                event.delta = delta;
            }
        }
    }

    if let Some(raw) = wire.response {
        let keep_raw = kind == EventKind::Completed;
        event.response = Some(parse_response_snapshot(raw, keep_raw)?);
    }

    if kind == EventKind::Error {
        event.error = Some(top_level_error(wire.error, wire.code, wire.message));
    }

    Ok(Some(event))
}

fn top_level_error(
    nested: Option<ProviderErrorBody>,
    code: Option<serde_json::Value>,
    message: Option<String>,
) -> ProviderErrorBody {
    let mut body = nested.unwrap_or_default();
    if body.code.is_empty() {
        body.code = match code {
            Some(serde_json::Value::String(code)) => code,
            Some(serde_json::Value::Number(code)) => code.to_string(),
            _ => String::new(),
        };
    }
    if body.message.is_empty() {
        body.message = message.unwrap_or_default();
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_text_delta_with_obfuscation() {
        let event = decode_responses_event(
            r#"{"type":"response.output_text.delta","item_id":"msg_1","output_index":0,"delta":"Hel","obfuscation":"abc"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.kind, EventKind::OutputTextDelta);
        assert_eq!(event.delta, "Hel");
        assert_eq!(event.output_index, Some(0));
        assert_eq!(event.passthrough_token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_decode_completed_keeps_raw_snapshot() {
        let event = decode_responses_event(
            r#"{"type":"response.completed","response":{"id":"resp_1","background":false,"output":[],"usage":{"input_tokens":5,"output_tokens":3,"total_tokens":8}}}"#,
        )
        .unwrap()
        .unwrap();
        let snapshot = event.response.unwrap();
        assert!(snapshot.raw.unwrap().get().contains("\"background\":false"));
        assert_eq!(snapshot.usage.unwrap().total_tokens, 8);
    }

    #[test]
    fn test_decode_created_does_not_keep_raw() {
        let event = decode_responses_event(
            r#"{"type":"response.created","response":{"id":"resp_1","model":"gpt-5","created_at":1}}"#,
        )
        .unwrap()
        .unwrap();
        assert!(event.response.unwrap().raw.is_none());
    }

    #[test]
    fn test_decode_error_event_reads_top_level_fields() {
        let event = decode_responses_event(
            r#"{"type":"error","code":"rate_limit_exceeded","message":"slow down","param":null}"#,
        )
        .unwrap()
        .unwrap();
        let err = event.error.unwrap();
        assert_eq!(err.code, "rate_limit_exceeded");
        assert_eq!(err.message, "slow down");
    }

    #[test]
    fn test_decode_arguments_done_uses_arguments_field() {
        let event = decode_responses_event(
            r#"{"type":"response.function_call_arguments.done","item_id":"fc_1","arguments":"{\"q\":\"x\"}"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.kind, EventKind::FunctionCallArgumentsDone);
        assert_eq!(event.delta, r#"{"q":"x"}"#);
    }

    #[test]
    fn test_unknown_event_type_is_ignored() {
        let event =
            decode_responses_event(r#"{"type":"response.content_part.added","item_id":"m"}"#)
                .unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(decode_responses_event("{not json").is_err());
    }
}
