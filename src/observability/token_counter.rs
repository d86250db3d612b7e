use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::protocol::canonical::Usage;

/// Per-message framing overhead added by chat-style prompt estimation.
const TOKENS_PER_MESSAGE: u64 = 3;
/// Tokens that prime the assistant reply.
const REPLY_PRIMING_TOKENS: u64 = 3;

/// Counts tokens for billing fallbacks.
pub trait Tokenizer: Send + Sync {
    fn count_text_tokens(&self, text: &str, model: &str) -> u64;
}

/// Lightweight heuristic (`bytes / 4`) that avoids loading model BPE tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count_text_tokens(&self, text: &str, model: &str) -> u64 {
        estimate_tokens(text, model)
    }
}

/// Estimate the number of tokens in `text` for the given model.
#[must_use]
pub fn estimate_tokens(text: &str, _model: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Estimate prompt tokens for an inbound request body of any ingress shape.
///
/// Counts chat `messages`, Responses `input`/`instructions`, Anthropic
/// `system`, Gemini `contents`/`systemInstruction`, and serialized tool
/// definitions.
#[must_use]
pub fn estimate_prompt_tokens(inbound: &Value, model: &str, tokenizer: &dyn Tokenizer) -> u64 {
    let mut text = String::new();
    let mut messages: u64 = 0;

    if let Some(list) = inbound.get("messages").and_then(Value::as_array) {
        for message in list {
            messages += 1;
            collect_text(message.get("content"), &mut text);
            if let Some(calls) = message.get("tool_calls") {
                push_serialized(calls, &mut text);
            }
        }
    }
    match inbound.get("input") {
        Some(Value::String(input)) => {
            messages += 1;
            text.push_str(input);
        }
        Some(Value::Array(items)) => {
            for item in items {
                messages += 1;
                collect_text(item.get("content"), &mut text);
                for key in ["arguments", "output"] {
                    if let Some(Value::String(value)) = item.get(key) {
                        text.push_str(value);
                    }
                }
            }
        }
        _ => {}
    }
    for key in ["instructions", "system"] {
        collect_text(inbound.get(key), &mut text);
    }
    if let Some(contents) = inbound.get("contents").and_then(Value::as_array) {
        for content in contents {
            messages += 1;
            collect_text(content.get("parts"), &mut text);
        }
    }
    if let Some(system) = inbound
        .get("systemInstruction")
        .or_else(|| inbound.get("system_instruction"))
    {
        collect_text(system.get("parts"), &mut text);
    }
    if let Some(tools) = inbound.get("tools") {
        push_serialized(tools, &mut text);
    }

    if text.is_empty() && messages == 0 {
        return 0;
    }
    tokenizer.count_text_tokens(&text, model) + messages * TOKENS_PER_MESSAGE + REPLY_PRIMING_TOKENS
}

fn collect_text(value: Option<&Value>, out: &mut String) {
    match value {
        Some(Value::String(text)) => out.push_str(text),
        Some(Value::Array(parts)) => {
            for part in parts {
                match part {
                    Value::String(text) => out.push_str(text),
                    Value::Object(obj) => {
                        if let Some(Value::String(text)) = obj.get("text") {
                            out.push_str(text);
                        }
                        if let Some(inner) = obj.get("content") {
                            collect_text(Some(inner), out);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn push_serialized(value: &Value, out: &mut String) {
    if let Ok(serialized) = serde_json::to_string(value) {
        out.push_str(&serialized);
    }
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(model: &str, channel: &str, usage: &Usage, duration: Duration) {
    info!(
        model = model,
        channel = channel,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        cached_tokens = usage.prompt_tokens_details.cached_tokens,
        reasoning_tokens = usage.completion_tokens_details.reasoning_tokens,
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}
