//! Gemini native wire types read by the usage probe.
use serde::Deserialize;

use crate::protocol::canonical::{CompletionTokensDetails, PromptTokensDetails, Usage};

/// Completion tokens billed per generated inline image when upstream
/// reports no candidate tokens.
pub const TOKENS_PER_INLINE_IMAGE: u64 = 258;

/// One `generateContent` response or stream chunk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    pub usage_metadata: Option<GeminiUsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    #[serde(default)]
    pub content: Option<GeminiContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

/// A content part. Unknown part kinds deserialize with every field empty.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thought: Option<bool>,
    #[serde(default)]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(default)]
    pub inline_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeminiFunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiModalityCount {
    #[serde(default)]
    pub modality: String,
    #[serde(default)]
    pub token_count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
    #[serde(default)]
    pub thoughts_token_count: u64,
    #[serde(default)]
    pub cached_content_token_count: u64,
    #[serde(default)]
    pub prompt_tokens_details: Vec<GeminiModalityCount>,
}

impl GeminiUsageMetadata {
    /// Chat-shaped usage. Thought tokens are billed as completion tokens.
    #[must_use]
    pub fn to_usage(&self) -> Usage {
        let mut prompt_details = PromptTokensDetails {
            cached_tokens: self.cached_content_token_count,
            ..PromptTokensDetails::default()
        };
        for detail in &self.prompt_tokens_details {
            match detail.modality.as_str() {
                "AUDIO" => prompt_details.audio_tokens = detail.token_count,
                "TEXT" => prompt_details.text_tokens = detail.token_count,
                _ => {}
            }
        }
        Usage {
            prompt_tokens: self.prompt_token_count,
            completion_tokens: self.candidates_token_count + self.thoughts_token_count,
            total_tokens: self.total_token_count,
            prompt_tokens_details: prompt_details,
            completion_tokens_details: CompletionTokensDetails {
                reasoning_tokens: self.thoughts_token_count,
                ..CompletionTokensDetails::default()
            },
        }
    }
}

impl GeminiResponse {
    /// Append billable text and return the number of inline images seen.
    pub fn collect_text(&self, out: &mut String) -> u64 {
        let mut images = 0;
        for candidate in &self.candidates {
            let Some(content) = &candidate.content else { continue };
            for part in &content.parts {
                if let Some(text) = &part.text {
                    out.push_str(text);
                }
                if let Some(call) = &part.function_call {
                    out.push_str(&call.name);
                    if !call.args.is_null() {
                        out.push_str(&call.args.to_string());
                    }
                }
                if part.inline_data.is_some() {
                    images += 1;
                }
            }
        }
        images
    }

    #[must_use]
    pub fn block_reason(&self) -> Option<&str> {
        if !self.candidates.is_empty() {
            return None;
        }
        self.prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_metadata_counts_thoughts_as_completion() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}],"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":4,"thoughtsTokenCount":6,"totalTokenCount":20,"cachedContentTokenCount":3,"promptTokensDetails":[{"modality":"TEXT","tokenCount":10}]}}"#,
        )
        .unwrap();
        let usage = response.usage_metadata.unwrap().to_usage();
        assert_eq!(usage.completion_tokens, 10);
        assert_eq!(usage.completion_tokens_details.reasoning_tokens, 6);
        assert_eq!(usage.prompt_tokens_details.cached_tokens, 3);
        assert_eq!(usage.prompt_tokens_details.text_tokens, 10);
        assert_eq!(usage.total_tokens, 20);
    }

    #[test]
    fn test_collect_text_counts_images() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"inlineData":{"mimeType":"image/png","data":"x"}},{"functionCall":{"name":"f","args":{"k":1}}}]}}]}"#,
        )
        .unwrap();
        let mut text = String::new();
        assert_eq!(response.collect_text(&mut text), 1);
        assert_eq!(text, r#"af{"k":1}"#);
    }

    #[test]
    fn test_block_reason_only_without_candidates() {
        let response: GeminiResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert_eq!(response.block_reason(), Some("SAFETY"));
    }
}
