//! Anthropic Messages wire types read by the usage probe.
//!
//! Only the fields billing needs are modelled; everything else in a
//! passthrough body is forwarded untouched and never decoded.
use serde::Deserialize;

use crate::protocol::canonical::{CompletionTokensDetails, PromptTokensDetails, Usage};

/// Usage block of a message or a `message_delta` event.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl AnthropicUsage {
    /// Fold a later report into this one. Zero fields never overwrite.
    pub fn merge(&mut self, later: &AnthropicUsage) {
        let keep = |current: &mut u64, update: u64| {
            if update != 0 {
                *current = update;
            }
        };
        keep(&mut self.input_tokens, later.input_tokens);
        keep(&mut self.output_tokens, later.output_tokens);
        keep(&mut self.cache_read_input_tokens, later.cache_read_input_tokens);
        keep(
            &mut self.cache_creation_input_tokens,
            later.cache_creation_input_tokens,
        );
    }

    #[must_use]
    pub fn to_usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
            prompt_tokens_details: PromptTokensDetails {
                cached_tokens: self.cache_read_input_tokens,
                ..PromptTokensDetails::default()
            },
            completion_tokens_details: CompletionTokensDetails::default(),
        }
    }
}

/// A content block of a buffered message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

impl AnthropicContentBlock {
    /// Billable text of the block.
    pub fn push_text(&self, out: &mut String) {
        match self {
            Self::Text { text } => out.push_str(text),
            Self::Thinking { thinking } => out.push_str(thinking),
            Self::ToolUse { name, input } => {
                out.push_str(name);
                if !input.is_null() {
                    out.push_str(&input.to_string());
                }
            }
            Self::Other => {}
        }
    }
}

/// Buffered Messages response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnthropicMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

/// One Messages stream event.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: AnthropicMessage },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { content_block: AnthropicContentBlock },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: AnthropicDelta },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    #[serde(rename = "error")]
    Error { error: AnthropicErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnthropicErrorBody {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}
