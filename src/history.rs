//! Conversation history hand-off.
//!
//! The relay never waits on persistence: a finished exchange is handed to a
//! [`ConversationSink`] on the blocking pool, and failures or panics there
//! are logged and dropped.
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::RelayError;
use crate::protocol::canonical::{IngressApi, Usage};
use crate::util::unix_now_millis;

/// One message of a stored conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl ConversationMessage {
    fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Persistence backend for finished conversations.
pub trait ConversationSink: Send + Sync {
    /// Store one full exchange.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Persistence`] when the backend rejects the record.
    #[allow(clippy::too_many_arguments)]
    fn save_full_conversation(
        &self,
        conversation_id: &str,
        messages: &[ConversationMessage],
        response: &Value,
        model: &str,
        user_id: u64,
        token_id: u64,
        channel_id: &str,
    ) -> Result<(), RelayError>;
}

/// Writes conversations to the log instead of a store.
#[derive(Debug, Default)]
pub struct TracingConversationSink;

impl ConversationSink for TracingConversationSink {
    fn save_full_conversation(
        &self,
        conversation_id: &str,
        messages: &[ConversationMessage],
        response: &Value,
        model: &str,
        user_id: u64,
        token_id: u64,
        channel_id: &str,
    ) -> Result<(), RelayError> {
        let response_len = serde_json::to_vec(response)
            .map_err(|err| RelayError::Persistence(err.to_string()))?
            .len();
        tracing::debug!(
            conversation_id,
            model,
            user_id,
            token_id,
            channel = channel_id,
            messages = messages.len(),
            response_len,
            "conversation recorded"
        );
        Ok(())
    }
}

/// Everything needed to persist one exchange.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub messages: Vec<ConversationMessage>,
    pub response: Value,
    pub model: String,
    pub user_id: u64,
    pub token_id: u64,
    pub channel_id: String,
}

/// `conv_<request id>_<unix millis>`.
#[must_use]
pub fn conversation_id(request_id: &str) -> String {
    format!("conv_{request_id}_{}", unix_now_millis())
}

/// Persist `record` on the blocking pool, since sinks may do synchronous
/// I/O. Errors and panics are logged only.
pub fn spawn_save(
    sink: Arc<dyn ConversationSink>,
    record: ConversationRecord,
) -> tokio::task::JoinHandle<()> {
    let conversation_id = record.conversation_id.clone();
    let save = tokio::task::spawn_blocking(move || {
        sink.save_full_conversation(
            &record.conversation_id,
            &record.messages,
            &record.response,
            &record.model,
            record.user_id,
            record.token_id,
            &record.channel_id,
        )
    });
    tokio::spawn(async move {
        match save.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(
                %conversation_id,
                error = %err,
                "failed to save conversation"
            ),
            Err(err) if err.is_panic() => {
                let panic = err.into_panic();
                tracing::error!(
                    %conversation_id,
                    panic = panic_message(panic.as_ref()),
                    "conversation sink panicked"
                );
            }
            Err(err) => tracing::warn!(
                %conversation_id,
                error = %err,
                "conversation save was cancelled"
            ),
        }
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// The assistant turn that closes a stored conversation.
#[must_use]
pub fn assistant_message(
    content: &str,
    tool_calls: Option<Value>,
    finish_reason: &str,
) -> ConversationMessage {
    ConversationMessage {
        tool_calls,
        finish_reason: (!finish_reason.is_empty()).then(|| finish_reason.to_string()),
        ..ConversationMessage::new("assistant", content)
    }
}

/// Minimal chat-completion shaped summary of a response, used as the stored
/// response body when the client never received one as JSON.
#[must_use]
pub fn response_summary(id: &str, model: &str, text: &str, usage: &Usage) -> Value {
    serde_json::json!({
        "id": id,
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop",
        }],
        "usage": usage,
    })
}

/// Flatten an inbound request body into stored messages.
#[must_use]
pub fn messages_from_request(ingress: IngressApi, body: &Value) -> Vec<ConversationMessage> {
    let messages = match ingress {
        IngressApi::OpenAiChat => chat_messages(body),
        IngressApi::OpenAiResponses => responses_messages(body),
        IngressApi::Anthropic => anthropic_messages(body),
        IngressApi::Gemini => gemini_messages(body),
    };
    if messages.is_empty() {
        return vec![ConversationMessage::new("user", "[unparsed request]")];
    }
    messages
}

fn chat_messages(body: &Value) -> Vec<ConversationMessage> {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return Vec::new();
    };
    messages
        .iter()
        .map(|message| {
            let string_field = |key: &str| {
                message
                    .get(key)
                    .and_then(Value::as_str)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            };
            ConversationMessage {
                name: string_field("name"),
                tool_call_id: string_field("tool_call_id"),
                tool_calls: message
                    .get("tool_calls")
                    .filter(|calls| calls.as_array().is_some_and(|calls| !calls.is_empty()))
                    .cloned(),
                ..ConversationMessage::new(
                    string_field("role").unwrap_or_else(|| "user".to_string()),
                    content_text(message.get("content")),
                )
            }
        })
        .collect()
}

fn responses_messages(body: &Value) -> Vec<ConversationMessage> {
    let mut out = Vec::new();
    if let Some(instructions) = body.get("instructions").and_then(Value::as_str) {
        if !instructions.trim().is_empty() {
            out.push(ConversationMessage::new("system", instructions));
        }
    }
    if let Some(input) = body.get("input") {
        push_responses_input(input, &mut out);
    }
    out
}

fn push_responses_input(item: &Value, out: &mut Vec<ConversationMessage>) {
    match item {
        Value::String(text) => out.push(ConversationMessage::new("user", text.as_str())),
        Value::Array(items) => {
            for item in items {
                push_responses_input(item, out);
            }
        }
        Value::Object(map) => {
            let role = map
                .get("role")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|role| !role.is_empty())
                .unwrap_or("user");
            let mut content = content_text(map.get("content"));
            if content.is_empty() {
                if let Some(text) = map.get("text").and_then(Value::as_str) {
                    content = text.to_string();
                }
            }
            out.push(ConversationMessage::new(role, content));
        }
        _ => {}
    }
}

fn anthropic_messages(body: &Value) -> Vec<ConversationMessage> {
    let mut out = Vec::new();
    let system = content_text(body.get("system"));
    if !system.is_empty() {
        out.push(ConversationMessage::new("system", system));
    }
    for message in body
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let mut content = content_text(message.get("content"));
        if content.is_empty() {
            if let Some(raw) = message.get("content").filter(|raw| !raw.is_null()) {
                content = raw.to_string();
            }
        }
        out.push(ConversationMessage::new(role, content));
    }
    out
}

fn gemini_messages(body: &Value) -> Vec<ConversationMessage> {
    let parts_text = |content: &Value| {
        content
            .get("parts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<String>()
    };
    let mut out = Vec::new();
    if let Some(system) = body
        .get("systemInstruction")
        .or_else(|| body.get("system_instruction"))
    {
        let text = parts_text(system);
        if !text.is_empty() {
            out.push(ConversationMessage::new("system", text));
        }
    }
    for content in body
        .get("contents")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let role = match content.get("role").and_then(Value::as_str) {
            Some("model") => "assistant",
            Some(role) if !role.is_empty() => role,
            _ => "user",
        };
        out.push(ConversationMessage::new(role, parts_text(content)));
    }
    out
}

/// Text of a message content that is a string, a part list or one part.
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter(|part| {
                matches!(
                    part.get("type").and_then(Value::as_str),
                    Some("text" | "input_text" | "output_text") | None
                )
            })
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
        Some(Value::Object(part)) => part
            .get("text")
            .and_then(Value::as_str)
            .map_or_else(|| Value::Object(part.clone()).to_string(), str::to_string),
        _ => String::new(),
    }
}
