//! Re-emission of canonical events as chat-completion stream chunks.
use bytes::Bytes;
use rustc_hash::FxHashSet;

use crate::error::RelayError;
use crate::observability::token_counter::Tokenizer;
use crate::protocol::canonical::{CanonicalEvent, Usage};
use crate::protocol::openai_chat::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkFunction, ChunkToolCall, CHUNK_OBJECT,
};
use crate::stream::sse::{data_frame, done_frame};
use crate::stream::state::{Step, ToolCallDelta, TranslationState};
use crate::stream::thinking::Emission;

use super::Frames;

/// Identity and options of the chunks a sink writes.
#[derive(Debug, Clone)]
pub struct ChatStreamOptions {
    pub id: String,
    pub model: String,
    pub created: u64,
    pub include_usage: bool,
    pub thinking_to_content: bool,
}

/// Turns canonical events into chat chunks, one event at a time.
///
/// The start chunk is sent lazily before the first visible content and
/// exactly one stop chunk is written. Once text has been produced, tool-call
/// updates are still accumulated but no longer forwarded.
#[derive(Debug)]
pub struct ChatChunkSink {
    state: TranslationState,
    id: String,
    model: String,
    created: u64,
    service_tier: Option<String>,
    include_usage: bool,
    sent_start: bool,
    sent_stop: bool,
    saw_tool_call: bool,
    named_calls: FxHashSet<String>,
}

impl ChatChunkSink {
    #[must_use]
    pub fn new(options: ChatStreamOptions) -> Self {
        Self {
            state: TranslationState::new(options.thinking_to_content),
            id: options.id,
            model: options.model,
            created: options.created,
            service_tier: None,
            include_usage: options.include_usage,
            sent_start: false,
            sent_stop: false,
            saw_tool_call: false,
            named_calls: FxHashSet::default(),
        }
    }

    /// HTTP status of the upstream response, attached to in-stream errors.
    #[must_use]
    pub fn with_upstream_status(mut self, status: u16) -> Self {
        self.state = self.state.with_upstream_status(status);
        self
    }

    #[must_use]
    pub fn state(&self) -> &TranslationState {
        &self.state
    }

    /// Apply one event and return the frames to write.
    ///
    /// # Errors
    ///
    /// Returns the provider error carried by error/failed events, or a
    /// serialization error.
    pub fn on_event(&mut self, event: CanonicalEvent) -> Result<Frames, RelayError> {
        let mut frames = Frames::new();
        match self.state.apply(event)? {
            Step::Nothing => {}
            Step::Metadata => self.refresh_metadata(),
            Step::Deltas(emissions) => {
                for emission in &emissions {
                    self.push_start(&mut frames)?;
                    let delta = match emission {
                        Emission::Content(text) => ChunkDelta {
                            content: Some(text.as_str()),
                            ..ChunkDelta::default()
                        },
                        Emission::Reasoning(text) => ChunkDelta {
                            reasoning_content: Some(text.as_str()),
                            ..ChunkDelta::default()
                        },
                    };
                    frames.push(self.delta_frame(delta, None)?);
                }
            }
            Step::ToolCall(call) => self.push_tool_call(&call, &mut frames)?,
            Step::Completed => {
                self.refresh_metadata();
                self.push_start(&mut frames)?;
                self.push_stop(&mut frames)?;
            }
        }
        Ok(frames)
    }

    /// Close the stream: pending markers, start/stop if never sent, the
    /// optional usage chunk and `[DONE]`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if a chunk cannot be encoded.
    pub fn finish(
        &mut self,
        prompt_estimate: u64,
        tokenizer: &dyn Tokenizer,
    ) -> Result<(Frames, Usage), RelayError> {
        let mut frames = Frames::new();
        if let Some(Emission::Content(marker)) = self.state.deltas.close() {
            if !self.sent_stop {
                self.push_start(&mut frames)?;
                let delta = ChunkDelta {
                    content: Some(marker.as_str()),
                    ..ChunkDelta::default()
                };
                frames.push(self.delta_frame(delta, None)?);
            }
        }
        let usage = self.final_usage(prompt_estimate, tokenizer);
        self.push_start(&mut frames)?;
        self.push_stop(&mut frames)?;
        if self.include_usage {
            frames.push(self.encode(Vec::new(), Some(&usage))?);
        }
        frames.push(done_frame());
        Ok((frames, usage))
    }

    /// Usage as it stands now; used when the client leaves early.
    #[must_use]
    pub fn final_usage(&self, prompt_estimate: u64, tokenizer: &dyn Tokenizer) -> Usage {
        self.state.finalize(prompt_estimate, &self.model, tokenizer).usage
    }

    fn refresh_metadata(&mut self) {
        let Some(snapshot) = self.state.snapshot() else {
            return;
        };
        if !snapshot.model.is_empty() {
            self.model.clone_from(&snapshot.model);
        }
        if snapshot.created_at != 0 {
            self.created = snapshot.created_at;
        }
        if let Some(tier) = &snapshot.service_tier {
            self.service_tier = Some(tier.clone());
        }
    }

    fn push_tool_call(&mut self, call: &ToolCallDelta, frames: &mut Frames) -> Result<(), RelayError> {
        if call.call_id.is_empty() || !self.state.deltas.text().is_empty() {
            return Ok(());
        }
        let name = match &call.name {
            Some(name) if !name.is_empty() && !self.named_calls.contains(&call.call_id) => {
                self.named_calls.insert(call.call_id.clone());
                Some(name.as_str())
            }
            _ => None,
        };
        if name.is_none() && call.arguments.is_empty() {
            return Ok(());
        }
        self.push_start(frames)?;
        let delta = ChunkDelta {
            tool_calls: Some(vec![ChunkToolCall {
                index: call.index,
                id: &call.call_id,
                kind: "function",
                function: ChunkFunction {
                    name,
                    arguments: &call.arguments,
                },
            }]),
            ..ChunkDelta::default()
        };
        frames.push(self.delta_frame(delta, None)?);
        self.saw_tool_call = true;
        Ok(())
    }

    fn push_start(&mut self, frames: &mut Frames) -> Result<(), RelayError> {
        if self.sent_start {
            return Ok(());
        }
        let delta = ChunkDelta {
            role: Some("assistant"),
            content: Some(""),
            refusal: Some(None),
            ..ChunkDelta::default()
        };
        frames.push(self.delta_frame(delta, None)?);
        self.sent_start = true;
        Ok(())
    }

    fn push_stop(&mut self, frames: &mut Frames) -> Result<(), RelayError> {
        if self.sent_stop {
            return Ok(());
        }
        let reason = self.finish_reason();
        frames.push(self.delta_frame(ChunkDelta::default(), Some(reason))?);
        self.sent_stop = true;
        Ok(())
    }

    fn finish_reason(&self) -> &'static str {
        if self.saw_tool_call && self.state.deltas.text().is_empty() {
            "tool_calls"
        } else {
            "stop"
        }
    }

    fn delta_frame(&self, delta: ChunkDelta<'_>, finish_reason: Option<&str>) -> Result<Bytes, RelayError> {
        self.encode(
            vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            None,
        )
    }

    fn encode(&self, choices: Vec<ChunkChoice<'_>>, usage: Option<&Usage>) -> Result<Bytes, RelayError> {
        let chunk = ChatCompletionChunk {
            id: &self.id,
            object: CHUNK_OBJECT,
            created: self.created,
            model: &self.model,
            service_tier: self.service_tier.as_deref(),
            choices,
            usage,
            obfuscation: self.state.passthrough_token(),
        };
        Ok(data_frame(&serde_json::to_vec(&chunk)?))
    }
}
