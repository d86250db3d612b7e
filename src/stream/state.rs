//! Per-request translation state fed by canonical events.
use crate::error::RelayError;
use crate::observability::token_counter::Tokenizer;
use crate::protocol::canonical::{
    CanonicalEvent, EventKind, OutputItem, OutputItemKind, ResponseSnapshot, Usage,
};

use super::accumulator::OutputAccumulator;
use super::thinking::{DeltaTracker, Emissions};
use super::usage::{reconcile, UsageSources};

/// Status reported for in-stream errors when the upstream status is unknown.
const DEFAULT_UPSTREAM_STATUS: u16 = 500;

/// What one event changed, for sinks that re-emit incrementally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Nothing,
    /// Snapshot metadata (model, created, service tier) became known.
    Metadata,
    Deltas(Emissions),
    ToolCall(ToolCallDelta),
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub call_id: String,
    pub index: usize,
    pub name: Option<String>,
    pub arguments: String,
}

/// Final merged result of one response.
#[derive(Debug)]
pub struct Finalized {
    pub outputs: Vec<OutputItem>,
    pub usage: Usage,
    pub snapshot: Option<ResponseSnapshot>,
}

/// Single-pass accumulation of everything a sink needs to finish.
#[derive(Debug)]
pub struct TranslationState {
    pub outputs: OutputAccumulator,
    pub deltas: DeltaTracker,
    snapshot: Option<ResponseSnapshot>,
    completed: Option<ResponseSnapshot>,
    last_message_id: Option<String>,
    role: Option<String>,
    last_passthrough_token: Option<String>,
    upstream_status: u16,
}

impl TranslationState {
    #[must_use]
    pub fn new(thinking_to_content: bool) -> Self {
        Self {
            outputs: OutputAccumulator::new(),
            deltas: DeltaTracker::new(thinking_to_content),
            snapshot: None,
            completed: None,
            last_message_id: None,
            role: None,
            last_passthrough_token: None,
            upstream_status: DEFAULT_UPSTREAM_STATUS,
        }
    }

    /// HTTP status of the upstream response, attached to in-stream errors.
    #[must_use]
    pub fn with_upstream_status(mut self, status: u16) -> Self {
        self.upstream_status = status;
        self
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Returns the mapped provider error for `Error` and `Failed` events and
    /// for completed snapshots that carry an error object.
    pub fn apply(&mut self, mut event: CanonicalEvent) -> Result<Step, RelayError> {
        if let Some(token) = event.passthrough_token.take() {
            self.last_passthrough_token = Some(token);
        }
        match event.kind {
            EventKind::Created | EventKind::InProgress => {
                let Some(snapshot) = event.response else {
                    return Ok(Step::Nothing);
                };
                if self.snapshot.is_none() {
                    self.snapshot = Some(snapshot);
                    return Ok(Step::Metadata);
                }
                Ok(Step::Nothing)
            }
            EventKind::OutputTextDelta => Ok(Step::Deltas(self.deltas.on_text(&event.delta))),
            EventKind::ReasoningSummaryDelta => Ok(Step::Deltas(
                self.deltas.on_reasoning(&event.delta).into_iter().collect(),
            )),
            EventKind::OutputItemAdded => Ok(event
                .item
                .map_or(Step::Nothing, |item| self.tool_call_step(&item))),
            EventKind::OutputItemDone => {
                let Some(item) = event.item else {
                    return Ok(Step::Nothing);
                };
                let step = self.tool_call_step(&item);
                if item.kind == OutputItemKind::Message {
                    if !item.id.is_empty() {
                        self.last_message_id = Some(item.id.clone());
                    }
                    if !item.role.is_empty() {
                        self.role = Some(item.role.clone());
                    }
                }
                self.outputs.apply_item(event.output_index, item);
                Ok(step)
            }
            EventKind::FunctionCallArgumentsDelta => {
                let Some(item_id) = event.item_id else {
                    return Ok(Step::Nothing);
                };
                let call_id = self.outputs.append_arguments_fragment(&item_id, &event.delta);
                Ok(self.tool_delta(call_id, event.delta))
            }
            EventKind::FunctionCallArgumentsDone => {
                let Some(item_id) = event.item_id else {
                    return Ok(Step::Nothing);
                };
                let update = self.outputs.apply_arguments_snapshot(&item_id, &event.delta);
                if update.delta.is_empty() {
                    return Ok(Step::Nothing);
                }
                let call_id = self.outputs.resolve_call_id(&item_id).to_string();
                Ok(self.tool_delta(call_id, update.delta))
            }
            EventKind::Completed => {
                if let Some(snapshot) = event.response {
                    if let Some(err) = snapshot.provider_error() {
                        return Err(RelayError::from_provider_body(err, self.upstream_status));
                    }
                    self.completed = Some(self.merge_metadata(snapshot));
                }
                Ok(Step::Completed)
            }
            EventKind::Error | EventKind::Failed => Err(stream_error(&event, self.upstream_status)),
        }
    }

    fn merge_metadata(&self, mut completed: ResponseSnapshot) -> ResponseSnapshot {
        if let Some(earlier) = &self.snapshot {
            if completed.id.is_empty() {
                completed.id.clone_from(&earlier.id);
            }
            if completed.model.is_empty() {
                completed.model.clone_from(&earlier.model);
            }
            if completed.created_at == 0 {
                completed.created_at = earlier.created_at;
            }
            if completed.service_tier.is_none() {
                completed.service_tier.clone_from(&earlier.service_tier);
            }
        }
        completed
    }

    fn tool_call_step(&mut self, item: &OutputItem) -> Step {
        let first_sight = item.kind == OutputItemKind::FunctionCall
            && !self.outputs.is_known_call(item.canonical_call_id());
        match self.outputs.register_function_call(item) {
            Some((call_id, update)) if first_sight || !update.delta.is_empty() => {
                self.tool_delta(call_id, update.delta)
            }
            _ => Step::Nothing,
        }
    }

    fn tool_delta(&mut self, call_id: String, arguments: String) -> Step {
        let index = self.outputs.tool_index(&call_id);
        let name = self.outputs.tool_name(&call_id).map(str::to_string);
        Step::ToolCall(ToolCallDelta {
            call_id,
            index,
            name,
            arguments,
        })
    }

    /// Latest metadata snapshot: the completed one, else created/in-progress.
    #[must_use]
    pub fn snapshot(&self) -> Option<&ResponseSnapshot> {
        self.completed.as_ref().or(self.snapshot.as_ref())
    }

    #[must_use]
    pub fn completed_snapshot(&self) -> Option<&ResponseSnapshot> {
        self.completed.as_ref()
    }

    /// Take the verbatim JSON of the completed snapshot, if captured.
    pub fn take_completed_raw(&mut self) -> Option<Box<serde_json::value::RawValue>> {
        self.completed.as_mut().and_then(|snapshot| snapshot.raw.take())
    }

    #[must_use]
    pub fn passthrough_token(&self) -> Option<&str> {
        self.last_passthrough_token.as_deref()
    }

    #[must_use]
    pub fn last_message_id(&self) -> Option<&str> {
        self.last_message_id.as_deref()
    }

    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// Text used when usage must be estimated: visible text, reasoning and
    /// tool-call names with arguments.
    #[must_use]
    pub fn usage_fallback_text(&self) -> String {
        let mut text = String::with_capacity(self.deltas.text().len());
        text.push_str(self.deltas.text());
        text.push_str(self.deltas.reasoning());
        for (_, name, arguments) in self.outputs.tool_calls() {
            text.push_str(name);
            text.push_str(arguments);
        }
        text
    }

    /// Finish the response: merge outputs and reconcile usage.
    #[must_use]
    pub fn finalize(&self, prompt_estimate: u64, model: &str, tokenizer: &dyn Tokenizer) -> Finalized {
        let snapshot_outputs = self
            .completed
            .as_ref()
            .map_or(&[][..], |snapshot| snapshot.output.as_slice());
        let merged = self.outputs.finalize(None);
        let text = self.usage_fallback_text();
        let usage = reconcile(
            &UsageSources {
                reported: self.completed.as_ref().and_then(|snapshot| snapshot.usage),
                text: &text,
                snapshot_outputs,
                merged_outputs: &merged,
                prompt_estimate,
                model,
            },
            tokenizer,
        );
        let outputs = self.outputs.finalize(Some(snapshot_outputs));
        Finalized {
            outputs,
            usage,
            snapshot: self.snapshot().cloned(),
        }
    }
}

fn stream_error(event: &CanonicalEvent, status: u16) -> RelayError {
    let body = event
        .error
        .as_ref()
        .filter(|err| err.is_set())
        .or_else(|| event.response.as_ref().and_then(ResponseSnapshot::provider_error));
    match body {
        Some(body) => RelayError::from_provider_body(body, status),
        None => {
            let kind = match event.kind {
                EventKind::Failed => "response.failed",
                _ => "response.error",
            };
            RelayError::provider(format!("responses stream error: {kind}"), "bad_response", status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::token_counter::HeuristicTokenizer;
    use crate::protocol::canonical::ProviderErrorBody;

    #[test]
    fn test_function_call_added_then_fragments() {
        let mut state = TranslationState::new(false);
        let added = CanonicalEvent::with_item(
            EventKind::OutputItemAdded,
            Some(0),
            OutputItem::function_call("fc_1", "call_1", "lookup", ""),
        );
        let Step::ToolCall(first) = state.apply(added).unwrap() else {
            panic!("expected tool call step");
        };
        assert_eq!(first.index, 0);
        assert_eq!(first.name.as_deref(), Some("lookup"));
        assert_eq!(first.arguments, "");

        let mut delta = CanonicalEvent::with_delta(EventKind::FunctionCallArgumentsDelta, "{\"q\":");
        delta.item_id = Some("fc_1".into());
        let Step::ToolCall(second) = state.apply(delta).unwrap() else {
            panic!("expected tool call step");
        };
        assert_eq!(second.call_id, "call_1");
        assert_eq!(second.arguments, "{\"q\":");
    }

    #[test]
    fn test_error_event_maps_provider_error() {
        let mut state = TranslationState::new(false);
        let mut event = CanonicalEvent::new(EventKind::Error);
        event.error = Some(ProviderErrorBody {
            message: "overloaded".into(),
            kind: "server_error".into(),
            ..ProviderErrorBody::default()
        });
        let err = state.apply(event).unwrap_err();
        assert_eq!(err.to_string(), "overloaded");
    }

    #[test]
    fn test_failed_without_body_is_generic() {
        let mut state = TranslationState::new(false);
        let err = state.apply(CanonicalEvent::new(EventKind::Failed)).unwrap_err();
        assert_eq!(err.to_string(), "responses stream error: response.failed");
    }

    #[test]
    fn test_completed_keeps_created_metadata() {
        let mut state = TranslationState::new(false);
        let mut created = CanonicalEvent::new(EventKind::Created);
        created.response = Some(ResponseSnapshot {
            id: "resp_1".into(),
            model: "gpt-5".into(),
            created_at: 7,
            ..ResponseSnapshot::default()
        });
        assert_eq!(state.apply(created).unwrap(), Step::Metadata);
        state
            .apply(CanonicalEvent::completed(ResponseSnapshot {
                usage: Some(Usage::new(1, 2, 3)),
                ..ResponseSnapshot::default()
            }))
            .unwrap();
        let snapshot = state.snapshot().unwrap();
        assert_eq!(snapshot.id, "resp_1");
        assert_eq!(snapshot.created_at, 7);
        let finalized = state.finalize(0, "gpt-5", &HeuristicTokenizer);
        assert_eq!(finalized.usage, Usage::new(1, 2, 3));
    }

    #[test]
    fn test_arguments_done_without_payload_keeps_fragments() {
        let mut state = TranslationState::new(false);
        state
            .apply(CanonicalEvent::with_item(
                EventKind::OutputItemAdded,
                Some(0),
                OutputItem::function_call("fc_1", "call_1", "lookup", ""),
            ))
            .unwrap();
        for fragment in ["{\"q\":", "\"rust\"}"] {
            let mut delta = CanonicalEvent::with_delta(EventKind::FunctionCallArgumentsDelta, fragment);
            delta.item_id = Some("fc_1".into());
            state.apply(delta).unwrap();
        }
        let mut done = CanonicalEvent::new(EventKind::FunctionCallArgumentsDone);
        done.item_id = Some("fc_1".into());
        assert_eq!(state.apply(done).unwrap(), Step::Nothing);
        assert_eq!(state.outputs.tool_arguments("call_1"), Some("{\"q\":\"rust\"}"));
    }

    #[test]
    fn test_in_stream_errors_carry_upstream_status() {
        let mut state = TranslationState::new(false).with_upstream_status(429);
        let mut event = CanonicalEvent::new(EventKind::Error);
        event.error = Some(ProviderErrorBody {
            message: "slow down".into(),
            ..ProviderErrorBody::default()
        });
        let err = state.apply(event).unwrap_err();
        assert_eq!(err.http_status().as_u16(), 429);

        let mut state = TranslationState::new(false).with_upstream_status(200);
        let err = state.apply(CanonicalEvent::new(EventKind::Failed)).unwrap_err();
        assert!(matches!(err, RelayError::Provider { status: 200, .. }));
        assert_eq!(err.http_status().as_u16(), 500);
    }
}
