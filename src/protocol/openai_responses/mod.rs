pub mod stream_event;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::protocol::canonical::{
    CompletionTokensDetails, OutputItem, PromptTokensDetails, ProviderErrorBody,
    ResponseSnapshot, Usage,
};

pub const RESPONSE_OBJECT: &str = "response";

/// Usage block of a Responses API object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub input_tokens_details: Option<ResponsesInputTokensDetails>,
    #[serde(default)]
    pub output_tokens_details: Option<ResponsesOutputTokensDetails>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResponsesInputTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub image_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResponsesOutputTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl ResponsesUsage {
    #[must_use]
    pub fn from_usage(usage: &Usage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            input_tokens_details: Some(ResponsesInputTokensDetails {
                cached_tokens: usage.prompt_tokens_details.cached_tokens,
                image_tokens: usage.prompt_tokens_details.image_tokens,
                audio_tokens: usage.prompt_tokens_details.audio_tokens,
            }),
            output_tokens_details: Some(ResponsesOutputTokensDetails {
                reasoning_tokens: usage.completion_tokens_details.reasoning_tokens,
            }),
        }
    }

    /// Convert to chat-completions usage. A missing total is derived.
    #[must_use]
    pub fn to_usage(&self) -> Usage {
        let total_tokens = if self.total_tokens == 0 {
            self.input_tokens + self.output_tokens
        } else {
            self.total_tokens
        };
        let input_details = self.input_tokens_details.unwrap_or_default();
        let output_details = self.output_tokens_details.unwrap_or_default();
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens,
            prompt_tokens_details: PromptTokensDetails {
                cached_tokens: input_details.cached_tokens,
                audio_tokens: input_details.audio_tokens,
                image_tokens: input_details.image_tokens,
                text_tokens: 0,
            },
            completion_tokens_details: CompletionTokensDetails {
                reasoning_tokens: output_details.reasoning_tokens,
                ..CompletionTokensDetails::default()
            },
        }
    }
}

/// Responses API object synthesized when no verbatim snapshot exists.
#[derive(Debug, Serialize)]
pub struct ResponseObject<'a> {
    pub id: &'a str,
    pub object: &'static str,
    pub created_at: u64,
    pub status: &'a str,
    pub model: &'a str,
    pub output: &'a [OutputItem],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<&'a str>,
    pub usage: ResponsesUsage,
}

#[derive(Debug, Deserialize)]
struct ResponseObjectWire {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    created_at: Option<serde_json::Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    service_tier: Option<String>,
    #[serde(default)]
    output: Option<Vec<OutputItem>>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
    #[serde(default)]
    error: Option<ProviderErrorBody>,
}

/// Parse a Responses API object into a snapshot.
///
/// When `keep_raw` is set the verbatim JSON is retained for re-emission.
///
/// # Errors
///
/// Returns the `serde_json` error when the object does not match the
/// Responses shape.
pub fn parse_response_snapshot(
    raw: Box<RawValue>,
    keep_raw: bool,
) -> Result<ResponseSnapshot, serde_json::Error> {
    let wire: ResponseObjectWire = serde_json::from_str(raw.get())?;
    Ok(ResponseSnapshot {
        id: wire.id,
        model: wire.model,
        created_at: wire.created_at.as_ref().map_or(0, timestamp_secs),
        status: wire.status,
        service_tier: wire.service_tier.filter(|tier| !tier.is_empty()),
        output: wire.output.unwrap_or_default(),
        usage: wire.usage.as_ref().map(ResponsesUsage::to_usage),
        error: wire.error,
        raw: keep_raw.then_some(raw),
    })
}

/// Parse a buffered (non-stream) Responses document.
///
/// # Errors
///
/// Returns the `serde_json` error when the body is not a Responses object.
pub fn parse_response_document(body: &[u8]) -> Result<ResponseSnapshot, serde_json::Error> {
    let raw: Box<RawValue> = serde_json::from_slice(body)?;
    parse_response_snapshot(raw, true)
}

fn timestamp_secs(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        _ => 0,
    }
}
