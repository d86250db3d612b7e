use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

pub type ExtraFields = serde_json::Map<String, serde_json::Value>;

/// Which ingress API the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngressApi {
    OpenAiChat,
    OpenAiResponses,
    Anthropic,
    Gemini,
}

/// The kind of provider a channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Codex,
    ClaudeCode,
    Gemini,
}

impl ProviderKind {
    #[must_use]
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "openai" => Some(Self::OpenAi),
            "codex" => Some(Self::Codex),
            "claude-code" => Some(Self::ClaudeCode),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }
}

/// Wire format of an upstream response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamWire {
    ChatCompletions,
    Responses,
    AnthropicMessages,
    GeminiNative,
}

/// Kind of a decoded upstream notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    InProgress,
    OutputTextDelta,
    ReasoningSummaryDelta,
    OutputItemAdded,
    OutputItemDone,
    FunctionCallArgumentsDelta,
    FunctionCallArgumentsDone,
    Completed,
    Error,
    Failed,
}

impl EventKind {
    /// Map a Responses API `type` tag to an event kind.
    ///
    /// Tags with no translation role (content part bookkeeping, `*.done`
    /// text echoes) return `None` and are dropped by the decoder.
    #[must_use]
    pub fn from_responses_type(tag: &str) -> Option<Self> {
        let kind = match tag {
            "response.created" => Self::Created,
            "response.in_progress" => Self::InProgress,
            "response.output_text.delta" => Self::OutputTextDelta,
            "response.reasoning_summary_text.delta" => Self::ReasoningSummaryDelta,
            "response.output_item.added" => Self::OutputItemAdded,
            "response.output_item.done" => Self::OutputItemDone,
            "response.function_call_arguments.delta" => Self::FunctionCallArgumentsDelta,
            "response.function_call_arguments.done" => Self::FunctionCallArgumentsDone,
            "response.completed" => Self::Completed,
            "error" | "response.error" => Self::Error,
            "response.failed" => Self::Failed,
            _ => return None,
        };
        Some(kind)
    }
}

/// Type tag of an output item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OutputItemKind {
    Message,
    FunctionCall,
    Reasoning,
    WebSearchCall,
    ImageGenerationCall,
    Other(String),
}

impl From<String> for OutputItemKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "message" => Self::Message,
            "function_call" => Self::FunctionCall,
            "reasoning" => Self::Reasoning,
            "web_search_call" => Self::WebSearchCall,
            "image_generation_call" => Self::ImageGenerationCall,
            _ => Self::Other(tag),
        }
    }
}

impl From<OutputItemKind> for String {
    fn from(kind: OutputItemKind) -> Self {
        match kind {
            OutputItemKind::Message => "message".to_string(),
            OutputItemKind::FunctionCall => "function_call".to_string(),
            OutputItemKind::Reasoning => "reasoning".to_string(),
            OutputItemKind::WebSearchCall => "web_search_call".to_string(),
            OutputItemKind::ImageGenerationCall => "image_generation_call".to_string(),
            OutputItemKind::Other(tag) => tag,
        }
    }
}

impl Default for OutputItemKind {
    fn default() -> Self {
        Self::Message
    }
}

/// One content part of a message output item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<serde_json::Value>>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl ContentPart {
    #[must_use]
    pub fn output_text(text: impl Into<String>) -> Self {
        Self {
            kind: "output_text".to_string(),
            text: text.into(),
            refusal: None,
            annotations: Some(Vec::new()),
            extra: ExtraFields::new(),
        }
    }
}

/// One structured unit of a response: message, function call or built-in
/// tool invocation. Unknown fields are carried verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type", default)]
    pub kind: OutputItemKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summary: Vec<ContentPart>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl OutputItem {
    /// A completed assistant message wrapping plain text.
    #[must_use]
    pub fn assistant_message(id: String, role: String, text: impl Into<String>) -> Self {
        Self {
            kind: OutputItemKind::Message,
            id,
            status: Some("completed".to_string()),
            role,
            content: vec![ContentPart::output_text(text)],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn function_call(id: &str, call_id: &str, name: &str, arguments: &str) -> Self {
        Self {
            kind: OutputItemKind::FunctionCall,
            id: id.to_string(),
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments: Some(arguments.to_string()),
            ..Self::default()
        }
    }

    /// Call id used to key argument tracking; falls back to the item id.
    #[must_use]
    pub fn canonical_call_id(&self) -> &str {
        let call_id = self.call_id.trim();
        if call_id.is_empty() {
            self.id.trim()
        } else {
            call_id
        }
    }
}

/// Prompt-side token breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub text_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub image_tokens: u64,
}

/// Completion-side token breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub text_tokens: u64,
}

/// Token usage in chat-completions shape. Zero means "not reported".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_tokens_details: PromptTokensDetails,
    #[serde(default)]
    pub completion_tokens_details: CompletionTokensDetails,
}

impl Usage {
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Error object reported by a provider inside an event or terminal snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl ProviderErrorBody {
    /// A provider error counts only when it carries a type or a code.
    #[must_use]
    pub fn is_set(&self) -> bool {
        !self.kind.is_empty() || !self.code.is_empty()
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

/// Authoritative description of a response carried by `created`,
/// `in_progress`, `completed` and `failed` events.
#[derive(Debug, Clone, Default)]
pub struct ResponseSnapshot {
    pub id: String,
    pub model: String,
    pub created_at: u64,
    pub status: Option<String>,
    pub service_tier: Option<String>,
    pub output: Vec<OutputItem>,
    pub usage: Option<Usage>,
    pub error: Option<ProviderErrorBody>,
    /// Verbatim JSON of the snapshot, captured for completed events only.
    pub raw: Option<Box<RawValue>>,
}

impl ResponseSnapshot {
    #[must_use]
    pub fn provider_error(&self) -> Option<&ProviderErrorBody> {
        self.error.as_ref().filter(|err| err.is_set())
    }
}

/// A decoded, vendor-independent representation of one upstream
/// streaming notification.
#[derive(Debug, Clone)]
pub struct CanonicalEvent {
    pub kind: EventKind,
    pub delta: String,
    pub item_id: Option<String>,
    pub output_index: Option<usize>,
    pub item: Option<OutputItem>,
    pub response: Option<ResponseSnapshot>,
    pub error: Option<ProviderErrorBody>,
    pub passthrough_token: Option<String>,
}

impl CanonicalEvent {
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            delta: String::new(),
            item_id: None,
            output_index: None,
            item: None,
            response: None,
            error: None,
            passthrough_token: None,
        }
    }

    #[must_use]
    pub fn with_delta(kind: EventKind, delta: impl Into<String>) -> Self {
        let mut event = Self::new(kind);
        event.delta = delta.into();
        event
    }

    #[must_use]
    pub fn with_item(kind: EventKind, output_index: Option<usize>, item: OutputItem) -> Self {
        let mut event = Self::new(kind);
        event.output_index = output_index;
        event.item = Some(item);
        event
    }

    #[must_use]
    pub fn completed(snapshot: ResponseSnapshot) -> Self {
        let mut event = Self::new(EventKind::Completed);
        event.response = Some(snapshot);
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_item_kind_roundtrips_unknown_tags() {
        let item: OutputItem =
            serde_json::from_str(r#"{"type":"mcp_call","id":"mcp_1","server":"x"}"#).unwrap();
        assert_eq!(item.kind, OutputItemKind::Other("mcp_call".to_string()));
        let encoded = serde_json::to_value(&item).unwrap();
        assert_eq!(encoded["type"], "mcp_call");
        assert_eq!(encoded["server"], "x");
    }

    #[test]
    fn test_canonical_call_id_falls_back_to_item_id() {
        let item = OutputItem::function_call("fc_1", "", "lookup", "");
        assert_eq!(item.canonical_call_id(), "fc_1");
        let item = OutputItem::function_call("fc_1", "call_1", "lookup", "");
        assert_eq!(item.canonical_call_id(), "call_1");
    }

    #[test]
    fn test_provider_error_requires_type_or_code() {
        let err: ProviderErrorBody = serde_json::from_str(r#"{"message":"x"}"#).unwrap();
        assert!(!err.is_set());
        let err: ProviderErrorBody =
            serde_json::from_str(r#"{"message":"x","code":429}"#).unwrap();
        assert!(err.is_set());
        assert_eq!(err.code, "429");
    }

    #[test]
    fn test_event_kind_maps_responses_tags() {
        assert_eq!(
            EventKind::from_responses_type("response.output_text.delta"),
            Some(EventKind::OutputTextDelta)
        );
        assert_eq!(EventKind::from_responses_type("response.content_part.added"), None);
        assert_eq!(EventKind::from_responses_type("response.failed"), Some(EventKind::Failed));
    }
}
