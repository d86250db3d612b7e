//! Non-streaming projections of a finished translation.
use std::fmt;

use bytes::Bytes;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::value::RawValue;

use crate::error::RelayError;
use crate::observability::token_counter::Tokenizer;
use crate::protocol::canonical::{OutputItem, OutputItemKind, Usage};
use crate::protocol::openai_chat::{
    ChatCompletion, ChatCompletionChoice, ChatFunctionCall, ChatMessage, ChatToolCall,
    COMPLETION_OBJECT,
};
use crate::protocol::openai_responses::{ResponseObject, ResponsesUsage, RESPONSE_OBJECT};
use crate::stream::state::TranslationState;
use crate::stream::thinking::{THINK_CLOSE, THINK_OPEN};
use crate::stream::usage::extract_message_text;
use crate::util::{prefixed_uuid, unix_now_secs};

const BILLING_KEY: &str = "billing";
const BACKGROUND_KEY: &str = "background";
const DEVELOPER_BILLING: &str = r#""billing":{"payer":"developer"}"#;

/// Render the Responses object for a non-stream caller.
///
/// A completed snapshot captured verbatim is re-emitted after the billing
/// rewrite. Otherwise an object is synthesized from the merged outputs, or
/// from one message wrapping the accumulated text, and gets the same rewrite.
///
/// # Errors
///
/// Returns a serialization error, or [`RelayError::BadResponseBody`] if the
/// captured snapshot is not a JSON object.
pub fn synthesize_response(
    state: &mut TranslationState,
    model: &str,
    prompt_estimate: u64,
    tokenizer: &dyn Tokenizer,
) -> Result<(Bytes, Usage), RelayError> {
    let finalized = state.finalize(prompt_estimate, model, tokenizer);
    if let Some(raw) = state.take_completed_raw() {
        let body = force_billing_developer(raw.get().as_bytes())?;
        return Ok((body, finalized.usage));
    }

    let snapshot = finalized.snapshot.unwrap_or_default();
    let id = if snapshot.id.is_empty() {
        prefixed_uuid("resp_")
    } else {
        snapshot.id
    };
    let model = if snapshot.model.is_empty() {
        model
    } else {
        snapshot.model.as_str()
    };
    let created_at = match snapshot.created_at {
        0 => unix_now_secs(),
        created => created,
    };

    let mut output = finalized.outputs;
    let text = state.deltas.text();
    if output.is_empty() && !text.is_empty() {
        let message_id = state
            .last_message_id()
            .map_or_else(|| prefixed_uuid("msg_"), str::to_string);
        let role = state.role().unwrap_or("assistant").to_string();
        output.push(OutputItem::assistant_message(message_id, role, text));
    }

    let object = ResponseObject {
        id: &id,
        object: RESPONSE_OBJECT,
        created_at,
        status: "completed",
        model,
        output: &output,
        service_tier: snapshot.service_tier.as_deref(),
        usage: ResponsesUsage::from_usage(&finalized.usage),
    };
    let body = force_billing_developer(&serde_json::to_vec(&object)?)?;
    Ok((body, finalized.usage))
}

/// Drop any top-level `billing` member and force developer billing.
///
/// The new member goes right after `background` when present, else at the
/// end. Member order is kept and every other value is copied verbatim.
///
/// # Errors
///
/// Returns [`RelayError::BadResponseBody`] when the body is not a JSON object.
pub fn force_billing_developer(raw: &[u8]) -> Result<Bytes, RelayError> {
    let RawMembers(members) = serde_json::from_slice(raw).map_err(|err| {
        RelayError::BadResponseBody(format!("response snapshot is not a JSON object: {err}"))
    })?;

    let mut out = Vec::with_capacity(raw.len() + DEVELOPER_BILLING.len() + 1);
    out.push(b'{');
    let mut inserted = false;
    for (key, value) in &members {
        if key == BILLING_KEY {
            continue;
        }
        push_separator(&mut out);
        serde_json::to_writer(&mut out, key)?;
        out.push(b':');
        out.extend_from_slice(value.get().as_bytes());
        if key == BACKGROUND_KEY && !inserted {
            push_separator(&mut out);
            out.extend_from_slice(DEVELOPER_BILLING.as_bytes());
            inserted = true;
        }
    }
    if !inserted {
        push_separator(&mut out);
        out.extend_from_slice(DEVELOPER_BILLING.as_bytes());
    }
    out.push(b'}');
    Ok(Bytes::from(out))
}

fn push_separator(out: &mut Vec<u8>) {
    if out.len() > 1 {
        out.push(b',');
    }
}

/// Top-level object members in document order, values left unparsed.
struct RawMembers<'a>(Vec<(String, &'a RawValue)>);

impl<'de> Deserialize<'de> for RawMembers<'de> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MembersVisitor;

        impl<'de> Visitor<'de> for MembersVisitor {
            type Value = RawMembers<'de>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a JSON object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut members = Vec::with_capacity(map.size_hint().unwrap_or(16));
                while let Some(member) = map.next_entry::<String, &'de RawValue>()? {
                    members.push(member);
                }
                Ok(RawMembers(members))
            }
        }

        deserializer.deserialize_map(MembersVisitor)
    }
}

/// Identity of a synthesized chat completion.
#[derive(Debug, Clone)]
pub struct ChatCompletionIdentity {
    pub id: String,
    pub model: String,
    pub created: u64,
    pub thinking_to_content: bool,
}

/// Project a finished translation onto one chat-completion body.
///
/// # Errors
///
/// Returns a serialization error if the body cannot be encoded.
pub fn synthesize_chat_completion(
    state: &TranslationState,
    identity: ChatCompletionIdentity,
    prompt_estimate: u64,
    tokenizer: &dyn Tokenizer,
) -> Result<(Bytes, Usage), RelayError> {
    let finalized = state.finalize(prompt_estimate, &identity.model, tokenizer);
    let snapshot = finalized.snapshot.as_ref();
    let model = snapshot
        .map(|snapshot| snapshot.model.as_str())
        .filter(|model| !model.is_empty())
        .map_or(identity.model.clone(), str::to_string);
    let created = snapshot
        .map(|snapshot| snapshot.created_at)
        .filter(|created| *created != 0)
        .unwrap_or(identity.created);
    let service_tier = snapshot.and_then(|snapshot| snapshot.service_tier.clone());

    let mut content = extract_message_text(&finalized.outputs);
    if content.is_empty() {
        content = state.deltas.text().to_string();
    }
    let mut reasoning = extract_reasoning_text(&finalized.outputs);
    if reasoning.is_empty() {
        reasoning = state.deltas.reasoning().to_string();
    }
    let tool_calls = chat_tool_calls(&finalized.outputs, state);

    let finish_reason = if !tool_calls.is_empty() && content.is_empty() {
        "tool_calls"
    } else {
        "stop"
    };

    let (content, reasoning_content) = if identity.thinking_to_content && !reasoning.is_empty() {
        (format!("{THINK_OPEN}{reasoning}{THINK_CLOSE}{content}"), None)
    } else {
        (content, Some(reasoning).filter(|text| !text.is_empty()))
    };
    let content = if content.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(content)
    };

    let completion = ChatCompletion {
        id: identity.id,
        object: COMPLETION_OBJECT,
        created,
        model,
        service_tier,
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant",
                content,
                reasoning_content,
                refusal: None,
                tool_calls,
            },
            finish_reason: finish_reason.to_string(),
        }],
        usage: finalized.usage,
    };
    Ok((Bytes::from(serde_json::to_vec(&completion)?), finalized.usage))
}

fn extract_reasoning_text(items: &[OutputItem]) -> String {
    let mut out = String::new();
    for item in items {
        if item.kind == OutputItemKind::Reasoning {
            for part in &item.summary {
                out.push_str(&part.text);
            }
        }
    }
    out
}

fn chat_tool_calls(items: &[OutputItem], state: &TranslationState) -> Vec<ChatToolCall> {
    let from_outputs: Vec<ChatToolCall> = items
        .iter()
        .filter(|item| item.kind == OutputItemKind::FunctionCall)
        .map(|item| ChatToolCall {
            id: item.canonical_call_id().to_string(),
            kind: "function",
            function: ChatFunctionCall {
                name: item.name.clone(),
                arguments: item.arguments.clone().unwrap_or_default(),
            },
        })
        .collect();
    if !from_outputs.is_empty() {
        return from_outputs;
    }
    state
        .outputs
        .tool_calls()
        .map(|(call_id, name, arguments)| ChatToolCall {
            id: call_id.to_string(),
            kind: "function",
            function: ChatFunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::token_counter::HeuristicTokenizer;
    use crate::protocol::canonical::{CanonicalEvent, EventKind, ResponseSnapshot};
    use crate::protocol::openai_responses::stream_event::decode_responses_event;

    fn apply_all(state: &mut TranslationState, payloads: &[&str]) {
        for payload in payloads {
            if let Some(event) = decode_responses_event(payload).unwrap() {
                state.apply(event).unwrap();
            }
        }
    }

    #[test]
    fn test_billing_inserted_after_background() {
        let raw = br#"{"id":"resp_1","background":false,"billing":{"payer":"openai"},"status":"completed"}"#;
        let out = force_billing_developer(raw).unwrap();
        assert_eq!(
            &out[..],
            br#"{"id":"resp_1","background":false,"billing":{"payer":"developer"},"status":"completed"}"#
        );
    }

    #[test]
    fn test_billing_appended_without_background() {
        let raw = br#"{ "id" : "resp_1", "output" : [] }"#;
        let out = force_billing_developer(raw).unwrap();
        assert_eq!(
            &out[..],
            br#"{"id":"resp_1","output":[],"billing":{"payer":"developer"}}"#
        );
    }

    #[test]
    fn test_billing_rewrite_keeps_nested_values_verbatim() {
        let raw = br#"{"output":[ {"text":"a\u00e9"} ],"billing":null}"#;
        let out = force_billing_developer(raw).unwrap();
        assert_eq!(
            &out[..],
            br#"{"output":[ {"text":"a\u00e9"} ],"billing":{"payer":"developer"}}"#
        );
    }

    #[test]
    fn test_billing_on_non_object_is_bad_body() {
        assert!(matches!(
            force_billing_developer(b"[1,2]"),
            Err(RelayError::BadResponseBody(_))
        ));
    }

    #[test]
    fn test_raw_completed_snapshot_is_reemitted() {
        let mut state = TranslationState::new(false);
        apply_all(
            &mut state,
            &[
                r#"{"type":"response.output_text.delta","delta":"hi"}"#,
                r#"{"type":"response.completed","response":{"id":"resp_9","background":true,"output":[],"usage":{"input_tokens":2,"output_tokens":1,"total_tokens":3}}}"#,
            ],
        );
        let (body, usage) = synthesize_response(&mut state, "gpt-5", 0, &HeuristicTokenizer).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["id"], "resp_9");
        assert_eq!(value["billing"]["payer"], "developer");
        assert_eq!(usage, Usage::new(2, 1, 3));
    }

    #[test]
    fn test_text_only_stream_synthesizes_message() {
        let mut state = TranslationState::new(false);
        state
            .apply(CanonicalEvent::with_delta(EventKind::OutputTextDelta, "hello world!"))
            .unwrap();
        let (body, usage) = synthesize_response(&mut state, "gpt-5", 7, &HeuristicTokenizer).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value["id"].as_str().unwrap().starts_with("resp_"));
        assert_eq!(value["status"], "completed");
        assert_eq!(value["model"], "gpt-5");
        assert_eq!(value["output"][0]["role"], "assistant");
        assert!(value["output"][0]["id"].as_str().unwrap().starts_with("msg_"));
        assert_eq!(value["output"][0]["content"][0]["text"], "hello world!");
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(value["usage"]["input_tokens"], 7);
        assert_eq!(value["usage"]["total_tokens"], 10);
        assert_eq!(value["billing"]["payer"], "developer");
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.ends_with(r#","billing":{"payer":"developer"}}"#));
    }

    #[test]
    fn test_chat_completion_from_tool_call_stream() {
        let mut state = TranslationState::new(false);
        apply_all(
            &mut state,
            &[
                r#"{"type":"response.created","response":{"id":"resp_1","model":"gpt-5-codex","created_at":9}}"#,
                r#"{"type":"response.output_item.added","output_index":0,"item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"lookup","arguments":""}}"#,
                r#"{"type":"response.function_call_arguments.delta","item_id":"fc_1","delta":"{\"q\":1}"}"#,
            ],
        );
        let identity = ChatCompletionIdentity {
            id: "chatcmpl-1".into(),
            model: "gpt-5".into(),
            created: 1,
            thinking_to_content: false,
        };
        let (body, usage) =
            synthesize_chat_completion(&state, identity, 4, &HeuristicTokenizer).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["model"], "gpt-5-codex");
        assert_eq!(value["created"], 9);
        let choice = &value["choices"][0];
        assert_eq!(choice["finish_reason"], "tool_calls");
        assert!(choice["message"]["content"].is_null());
        assert_eq!(choice["message"]["tool_calls"][0]["id"], "call_1");
        assert_eq!(choice["message"]["tool_calls"][0]["function"]["arguments"], "{\"q\":1}");
        assert!(usage.completion_tokens > 0);
    }

    #[test]
    fn test_chat_completion_folds_reasoning_into_content() {
        let mut state = TranslationState::new(true);
        state
            .apply(CanonicalEvent::with_delta(EventKind::ReasoningSummaryDelta, "plan"))
            .unwrap();
        state
            .apply(CanonicalEvent::with_delta(EventKind::OutputTextDelta, "done"))
            .unwrap();
        state
            .apply(CanonicalEvent::completed(ResponseSnapshot::default()))
            .unwrap();
        let identity = ChatCompletionIdentity {
            id: "chatcmpl-2".into(),
            model: "gpt-5".into(),
            created: 1,
            thinking_to_content: true,
        };
        let (body, _) = synthesize_chat_completion(&state, identity, 0, &HeuristicTokenizer).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let message = &value["choices"][0]["message"];
        assert_eq!(message["content"], "<think>\nplan\n</think>\ndone");
        assert!(message.get("reasoning_content").is_none());
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
    }
}
