//! Passthrough re-emission: upstream frames and bodies are forwarded as-is
//! while a probe collects what billing needs.
use bytes::Bytes;
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::Value;

use crate::error::RelayError;
use crate::observability::token_counter::Tokenizer;
use crate::protocol::anthropic::{AnthropicMessage, AnthropicStreamEvent, AnthropicDelta, AnthropicUsage};
use crate::protocol::canonical::{UpstreamWire, Usage};
use crate::protocol::gemini::{GeminiResponse, TOKENS_PER_INLINE_IMAGE};
use crate::protocol::openai_chat::CHUNK_OBJECT;
use crate::stream::decoder::{decode_document, PayloadDecoder};
use crate::stream::sse::{data_frame, parse_frame};
use crate::stream::state::TranslationState;
use crate::stream::thinking::{DeltaTracker, Emission};

use super::Frames;

/// Completion tokens added per chat tool call when usage is estimated.
const TOKENS_PER_TOOL_CALL: u64 = 7;

/// Per-wire billing probe over payloads that are never re-encoded.
#[derive(Debug)]
pub enum UsageProbe {
    /// Chat chunks and Responses events, folded through the translation state.
    Events {
        wire: UpstreamWire,
        decoder: PayloadDecoder,
        state: TranslationState,
    },
    Anthropic {
        usage: Option<AnthropicUsage>,
        text: String,
    },
    Gemini {
        usage: Option<Usage>,
        text: String,
        images: u64,
    },
}

impl UsageProbe {
    #[must_use]
    pub fn new(wire: UpstreamWire) -> Self {
        match wire {
            UpstreamWire::ChatCompletions | UpstreamWire::Responses => Self::Events {
                wire,
                decoder: PayloadDecoder::new(wire),
                state: TranslationState::new(false),
            },
            UpstreamWire::AnthropicMessages => Self::Anthropic {
                usage: None,
                text: String::new(),
            },
            UpstreamWire::GeminiNative => Self::Gemini {
                usage: None,
                text: String::new(),
                images: 0,
            },
        }
    }

    /// Observe one SSE data payload. Payloads the probe cannot read are
    /// logged and still forwarded by the caller.
    pub fn observe_payload(&mut self, payload: &str) {
        match self {
            Self::Events { decoder, state, .. } => match decoder.decode(payload) {
                Ok(events) => {
                    for event in events {
                        if let Err(err) = state.apply(event) {
                            tracing::debug!(error = %err, "upstream reported an error in passthrough stream");
                        }
                    }
                }
                Err(err) => tracing::warn!(error = %err, "usage probe skipped an upstream event"),
            },
            Self::Anthropic { usage, text } => {
                match serde_json::from_str::<AnthropicStreamEvent>(payload) {
                    Ok(event) => observe_anthropic_event(event, usage, text),
                    Err(err) => tracing::warn!(error = %err, "usage probe skipped an upstream event"),
                }
            }
            Self::Gemini {
                usage,
                text,
                images,
            } => match serde_json::from_str::<GeminiResponse>(payload) {
                Ok(chunk) => {
                    *images += chunk.collect_text(text);
                    if let Some(metadata) = &chunk.usage_metadata {
                        *usage = Some(metadata.to_usage());
                    }
                    if let Some(reason) = chunk.block_reason() {
                        tracing::info!(block_reason = reason, "upstream blocked the prompt");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "usage probe skipped an upstream event"),
            },
        }
    }

    /// Observe a buffered body.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BadResponseBody`] when the body does not parse,
    /// or the provider error a chat/responses document carries.
    pub fn observe_document(&mut self, body: &[u8]) -> Result<(), RelayError> {
        let bad_body = |err: serde_json::Error| {
            RelayError::BadResponseBody(format!("failed to parse upstream response: {err}"))
        };
        match self {
            Self::Events { wire, state, .. } => {
                for event in decode_document(*wire, body)? {
                    state.apply(event)?;
                }
            }
            Self::Anthropic { usage, text } => {
                let message: AnthropicMessage = serde_json::from_slice(body).map_err(bad_body)?;
                for block in &message.content {
                    block.push_text(text);
                }
                *usage = message.usage;
            }
            Self::Gemini {
                usage,
                text,
                images,
            } => {
                let response: GeminiResponse = serde_json::from_slice(body).map_err(bad_body)?;
                *images += response.collect_text(text);
                *usage = response.usage_metadata.as_ref().map(|metadata| metadata.to_usage());
                if let Some(reason) = response.block_reason() {
                    tracing::info!(block_reason = reason, "upstream blocked the prompt");
                }
            }
        }
        Ok(())
    }

    /// Text the caller was shown, for history records.
    #[must_use]
    pub fn collected_text(&self) -> String {
        match self {
            Self::Events { state, .. } => {
                let mut text = state.deltas.reasoning().to_string();
                text.push_str(state.deltas.text());
                text
            }
            Self::Anthropic { text, .. } | Self::Gemini { text, .. } => text.clone(),
        }
    }

    /// Reconciled usage for what was observed.
    #[must_use]
    pub fn usage(&self, prompt_estimate: u64, model: &str, tokenizer: &dyn Tokenizer) -> Usage {
        match self {
            Self::Events { wire, state, .. } => {
                let reported = state
                    .completed_snapshot()
                    .and_then(|snapshot| snapshot.usage)
                    .filter(|usage| !usage.is_empty());
                let mut usage = state.finalize(prompt_estimate, model, tokenizer).usage;
                if reported.is_none() && *wire == UpstreamWire::ChatCompletions {
                    let tool_calls = state.outputs.tool_calls().count() as u64;
                    usage.completion_tokens += tool_calls * TOKENS_PER_TOOL_CALL;
                    if usage.completion_tokens != 0 && usage.prompt_tokens == 0 {
                        usage.prompt_tokens = prompt_estimate;
                    }
                    usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
                }
                usage
            }
            Self::Anthropic { usage, text } => {
                let mut reported = usage.map(|usage| usage.to_usage()).unwrap_or_default();
                if reported.completion_tokens == 0 && !text.is_empty() {
                    reported.completion_tokens = tokenizer.count_text_tokens(text, model);
                    if reported.prompt_tokens == 0 {
                        reported.prompt_tokens = prompt_estimate;
                    }
                    reported.total_tokens = reported.prompt_tokens + reported.completion_tokens;
                }
                reported
            }
            Self::Gemini { usage, text, images } => {
                let mut reported = usage.unwrap_or_default();
                if reported.completion_tokens == 0 && *images != 0 {
                    reported.completion_tokens = images * TOKENS_PER_INLINE_IMAGE;
                }
                if reported.completion_tokens == 0 {
                    if text.is_empty() {
                        return Usage::default();
                    }
                    let completion_tokens = tokenizer.count_text_tokens(text, model);
                    return Usage::new(
                        prompt_estimate,
                        completion_tokens,
                        prompt_estimate + completion_tokens,
                    );
                }
                if reported.total_tokens == 0 {
                    reported.total_tokens = reported.prompt_tokens + reported.completion_tokens;
                }
                reported
            }
        }
    }
}

fn observe_anthropic_event(
    event: AnthropicStreamEvent,
    usage: &mut Option<AnthropicUsage>,
    text: &mut String,
) {
    match event {
        AnthropicStreamEvent::MessageStart { message } => {
            if let Some(reported) = message.usage {
                usage.get_or_insert_with(AnthropicUsage::default).merge(&reported);
            }
        }
        AnthropicStreamEvent::ContentBlockStart { content_block } => content_block.push_text(text),
        AnthropicStreamEvent::ContentBlockDelta { delta } => match delta {
            AnthropicDelta::TextDelta { text: delta } | AnthropicDelta::ThinkingDelta { thinking: delta } => {
                text.push_str(&delta);
            }
            AnthropicDelta::InputJsonDelta { partial_json } => text.push_str(&partial_json),
            AnthropicDelta::Other => {}
        },
        AnthropicStreamEvent::MessageDelta {
            usage: Some(reported),
        } => {
            usage.get_or_insert_with(AnthropicUsage::default).merge(&reported);
        }
        AnthropicStreamEvent::Error { error } => {
            tracing::debug!(kind = %error.kind, message = %error.message, "upstream reported an error in passthrough stream");
        }
        AnthropicStreamEvent::MessageDelta { usage: None } | AnthropicStreamEvent::Other => {}
    }
}

/// Rewrites chat chunks so reasoning arrives as `<think>`-wrapped content.
#[derive(Debug)]
struct ThinkingRewriter {
    tracker: DeltaTracker,
    last_id: String,
    last_model: String,
    last_created: u64,
}

impl ThinkingRewriter {
    fn new() -> Self {
        Self {
            tracker: DeltaTracker::new(true),
            last_id: String::new(),
            last_model: String::new(),
            last_created: 0,
        }
    }

    /// Rewritten payload, or `None` when the chunk carries no text to fold.
    fn rewrite(&mut self, payload: &str) -> Option<Bytes> {
        let mut chunk: Value = serde_json::from_str(payload).ok()?;
        if let Some(id) = chunk.get("id").and_then(Value::as_str) {
            self.last_id = id.to_string();
        }
        if let Some(model) = chunk.get("model").and_then(Value::as_str) {
            self.last_model = model.to_string();
        }
        if let Some(created) = chunk.get("created").and_then(Value::as_u64) {
            self.last_created = created;
        }

        let mut changed = false;
        for choice in chunk.get_mut("choices")?.as_array_mut()? {
            let Some(delta) = choice.get_mut("delta").and_then(Value::as_object_mut) else {
                continue;
            };
            let reasoning = ["reasoning_content", "reasoning"]
                .iter()
                .filter_map(|key| delta.get(*key).and_then(Value::as_str))
                .find(|text| !text.is_empty())
                .map(str::to_string);
            let content = delta
                .get("content")
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
                .map(str::to_string);
            if reasoning.is_none() && content.is_none() {
                continue;
            }

            let mut folded = String::new();
            if let Some(Emission::Content(text)) = reasoning
                .as_deref()
                .and_then(|reasoning| self.tracker.on_reasoning(reasoning))
            {
                folded.push_str(&text);
            }
            if let Some(content) = content.as_deref() {
                for emission in self.tracker.on_text(content) {
                    if let Emission::Content(text) = emission {
                        folded.push_str(&text);
                    }
                }
            }
            delta.remove("reasoning_content");
            delta.remove("reasoning");
            delta.insert("content".to_string(), Value::String(folded));
            changed = true;
        }
        if !changed {
            return None;
        }
        serde_json::to_vec(&chunk).ok().map(|json| data_frame(&json))
    }

    /// Closing marker frame when the stream ends inside thinking.
    fn close(&mut self) -> Option<Bytes> {
        let Some(Emission::Content(marker)) = self.tracker.close() else {
            return None;
        };
        let chunk = serde_json::json!({
            "id": self.last_id,
            "object": CHUNK_OBJECT,
            "created": self.last_created,
            "model": self.last_model,
            "choices": [{"index": 0, "delta": {"content": marker}, "finish_reason": null}],
        });
        serde_json::to_vec(&chunk).ok().map(|json| data_frame(&json))
    }
}

/// Shape of a chat chunk that only reports usage (`choices: []`).
#[derive(Deserialize)]
struct UsageOnlyChunk {
    choices: Vec<IgnoredAny>,
    usage: Option<IgnoredAny>,
}

fn is_usage_only_chunk(payload: &str) -> bool {
    serde_json::from_str::<UsageOnlyChunk>(payload)
        .is_ok_and(|chunk| chunk.choices.is_empty() && chunk.usage.is_some())
}

/// Forwards raw SSE frames unchanged while probing usage.
#[derive(Debug)]
pub struct PassthroughSink {
    probe: UsageProbe,
    rewriter: Option<ThinkingRewriter>,
    forwarded: usize,
    saw_done: bool,
    hide_usage_chunks: bool,
}

impl PassthroughSink {
    /// `thinking_to_content` only applies to chat-completion streams.
    #[must_use]
    pub fn new(wire: UpstreamWire, thinking_to_content: bool) -> Self {
        let rewriter = (thinking_to_content && wire == UpstreamWire::ChatCompletions)
            .then(ThinkingRewriter::new);
        Self {
            probe: UsageProbe::new(wire),
            rewriter,
            forwarded: 0,
            saw_done: false,
            hide_usage_chunks: false,
        }
    }

    /// Whether the client asked for the trailing usage chunk. Usage is always
    /// requested upstream for billing; when the client did not ask, chat
    /// usage-only chunks are read and then dropped.
    #[must_use]
    pub fn with_client_usage(mut self, include_usage: bool) -> Self {
        let chat_wire = matches!(
            self.probe,
            UsageProbe::Events {
                wire: UpstreamWire::ChatCompletions,
                ..
            }
        );
        self.hide_usage_chunks = chat_wire && !include_usage;
        self
    }

    #[must_use]
    pub fn probe(&self) -> &UsageProbe {
        &self.probe
    }

    /// Handle one raw upstream frame and return what to write.
    pub fn on_frame(&mut self, raw: Bytes) -> Frames {
        let mut frames = Frames::new();
        let Some(event) = parse_frame(&raw) else {
            frames.push(raw);
            return frames;
        };
        if event.data.trim() == "[DONE]" {
            if let Some(close) = self.rewriter.as_mut().and_then(ThinkingRewriter::close) {
                frames.push(close);
            }
            self.saw_done = true;
            frames.push(raw);
            return frames;
        }
        if !event.data.is_empty() {
            self.probe.observe_payload(&event.data);
            self.forwarded += 1;
            if self.hide_usage_chunks && is_usage_only_chunk(&event.data) {
                return frames;
            }
        }
        let rewritten = self
            .rewriter
            .as_mut()
            .and_then(|rewriter| rewriter.rewrite(&event.data));
        frames.push(rewritten.unwrap_or(raw));
        frames
    }

    /// Finish the stream and reconcile usage.
    ///
    /// # Errors
    ///
    /// Returns a provider-style error when upstream produced no event at all.
    pub fn finish(
        &mut self,
        prompt_estimate: u64,
        model: &str,
        tokenizer: &dyn Tokenizer,
    ) -> Result<(Frames, Usage), RelayError> {
        if self.forwarded == 0 {
            return Err(RelayError::provider(
                "no response received from upstream",
                "empty_response",
                500,
            ));
        }
        let mut frames = Frames::new();
        if !self.saw_done {
            if let Some(close) = self.rewriter.as_mut().and_then(ThinkingRewriter::close) {
                frames.push(close);
            }
        }
        Ok((frames, self.probe.usage(prompt_estimate, model, tokenizer)))
    }
}

/// Probe a buffered body that is forwarded byte-for-byte.
///
/// # Errors
///
/// Returns the parse or provider error found in the body.
pub fn probe_document(
    wire: UpstreamWire,
    body: &[u8],
    prompt_estimate: u64,
    model: &str,
    tokenizer: &dyn Tokenizer,
) -> Result<(UsageProbe, Usage), RelayError> {
    let mut probe = UsageProbe::new(wire);
    probe.observe_document(body)?;
    let usage = probe.usage(prompt_estimate, model, tokenizer);
    Ok((probe, usage))
}
