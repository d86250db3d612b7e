pub mod request;
pub mod stream_event;

use serde::{Deserialize, Serialize};

use crate::protocol::canonical::{
    CompletionTokensDetails, PromptTokensDetails, ProviderErrorBody, Usage,
};

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const COMPLETION_OBJECT: &str = "chat.completion";

/// One outbound chat-completions stream chunk.
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk<'a> {
    pub id: &'a str,
    pub object: &'static str,
    pub created: u64,
    pub model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<&'a str>,
    pub choices: Vec<ChunkChoice<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<&'a Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfuscation: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice<'a> {
    pub index: u32,
    pub delta: ChunkDelta<'a>,
    pub finish_reason: Option<&'a str>,
}

#[derive(Debug, Default, Serialize)]
pub struct ChunkDelta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<Option<&'a str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChunkToolCall<'a>>>,
}

#[derive(Debug, Serialize)]
pub struct ChunkToolCall<'a> {
    pub index: usize,
    pub id: &'a str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: ChunkFunction<'a>,
}

#[derive(Debug, Serialize)]
pub struct ChunkFunction<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    pub arguments: &'a str,
}

/// Non-streaming chat completion body.
#[derive(Debug, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<String>,
    pub choices: Vec<ChatCompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Serialize)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: ChatFunctionCall,
}

#[derive(Debug, Serialize)]
pub struct ChatFunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Chat usage as reported upstream; detail blocks may be null.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatUsageWire {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetailsWire>,
    #[serde(default)]
    pub completion_tokens_details: Option<CompletionTokensDetailsWire>,
    #[serde(default)]
    pub prompt_cache_hit_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PromptTokensDetailsWire {
    #[serde(default)]
    pub cached_tokens: Option<u64>,
    #[serde(default)]
    pub audio_tokens: Option<u64>,
    #[serde(default)]
    pub text_tokens: Option<u64>,
    #[serde(default)]
    pub image_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CompletionTokensDetailsWire {
    #[serde(default)]
    pub reasoning_tokens: Option<u64>,
    #[serde(default)]
    pub audio_tokens: Option<u64>,
    #[serde(default)]
    pub text_tokens: Option<u64>,
}

impl ChatUsageWire {
    #[must_use]
    pub fn to_usage(&self) -> Usage {
        let prompt = self.prompt_tokens_details.unwrap_or_default();
        let completion = self.completion_tokens_details.unwrap_or_default();
        let mut cached_tokens = prompt.cached_tokens.unwrap_or(0);
        if cached_tokens == 0 {
            cached_tokens = self.prompt_cache_hit_tokens;
        }
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            prompt_tokens_details: PromptTokensDetails {
                cached_tokens,
                audio_tokens: prompt.audio_tokens.unwrap_or(0),
                text_tokens: prompt.text_tokens.unwrap_or(0),
                image_tokens: prompt.image_tokens.unwrap_or(0),
            },
            completion_tokens_details: CompletionTokensDetails {
                reasoning_tokens: completion.reasoning_tokens.unwrap_or(0),
                audio_tokens: completion.audio_tokens.unwrap_or(0),
                text_tokens: completion.text_tokens.unwrap_or(0),
            },
        }
    }
}

/// Buffered chat completion as read for usage reconciliation.
#[derive(Debug, Default, Deserialize)]
pub struct ChatCompletionWire {
    #[serde(default)]
    pub choices: Vec<ChatChoiceWire>,
    #[serde(default)]
    pub usage: Option<ChatUsageWire>,
    #[serde(default)]
    pub error: Option<ProviderErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatChoiceWire {
    #[serde(default)]
    pub message: Option<ChatMessageWire>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatMessageWire {
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<serde_json::Value>>,
}

impl ChatMessageWire {
    /// Visible text of the message: string content, text parts and reasoning.
    #[must_use]
    pub fn visible_text(&self) -> String {
        let mut out = String::new();
        match &self.content {
            Some(serde_json::Value::String(text)) => out.push_str(text),
            Some(serde_json::Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(serde_json::Value::as_str) {
                        out.push_str(text);
                    }
                }
            }
            _ => {}
        }
        if let Some(reasoning) = &self.reasoning_content {
            out.push_str(reasoning);
        }
        if let Some(reasoning) = &self.reasoning {
            out.push_str(reasoning);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_chunk_serializes_null_refusal() {
        let chunk = ChatCompletionChunk {
            id: "chatcmpl-1",
            object: CHUNK_OBJECT,
            created: 1,
            model: "gpt-5",
            service_tier: None,
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: Some("assistant"),
                    content: Some(""),
                    refusal: Some(None),
                    ..ChunkDelta::default()
                },
                finish_reason: None,
            }],
            usage: None,
            obfuscation: None,
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert!(value["choices"][0]["delta"]["refusal"].is_null());
        assert!(value["choices"][0]["delta"]
            .as_object()
            .unwrap()
            .contains_key("refusal"));
        assert!(value["choices"][0]["finish_reason"].is_null());
        assert!(value.get("usage").is_none());
    }

    #[test]
    fn test_chat_usage_wire_tolerates_null_details() {
        let wire: ChatUsageWire = serde_json::from_str(
            r#"{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7,"prompt_tokens_details":null,"prompt_cache_hit_tokens":2}"#,
        )
        .unwrap();
        let usage = wire.to_usage();
        assert_eq!(usage.total_tokens, 7);
        assert_eq!(usage.prompt_tokens_details.cached_tokens, 2);
    }

    #[test]
    fn test_visible_text_joins_parts_and_reasoning() {
        let message: ChatMessageWire = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"a"},{"type":"text","text":"b"}],"reasoning_content":"r"}"#,
        )
        .unwrap();
        assert_eq!(message.visible_text(), "abr");
    }
}
