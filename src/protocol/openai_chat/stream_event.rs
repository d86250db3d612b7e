use rustc_hash::FxHashMap;
use serde::Deserialize;
use smallvec::SmallVec;

use crate::protocol::canonical::{
    CanonicalEvent, EventKind, OutputItem, ProviderErrorBody, ResponseSnapshot,
};

use super::ChatUsageWire;

#[derive(Debug, Deserialize)]
struct ChunkWire {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    created: u64,
    #[serde(default)]
    choices: Vec<ChoiceWire>,
    #[serde(default)]
    usage: Option<ChatUsageWire>,
    #[serde(default)]
    error: Option<ProviderErrorBody>,
    #[serde(default)]
    obfuscation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceWire {
    #[serde(default)]
    delta: Option<DeltaWire>,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaWire {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallWire>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallWire {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionWire>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionWire {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

pub type ChunkEvents = SmallVec<[CanonicalEvent; 2]>;

/// Decodes chat-completion chunks into canonical events.
///
/// Tool calls are keyed by their chunk index; later fragments usually omit
/// the call id, so the first id seen for an index is remembered.
#[derive(Debug, Default)]
pub struct ChatChunkDecoder {
    call_id_by_index: FxHashMap<usize, String>,
    announced_snapshot: bool,
}

impl ChatChunkDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk payload.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the payload is not a chat chunk.
    pub fn decode(&mut self, payload: &str) -> Result<ChunkEvents, serde_json::Error> {
        let wire: ChunkWire = serde_json::from_str(payload)?;
        let mut events = ChunkEvents::new();
        let token = wire.obfuscation.filter(|token| !token.is_empty());

        if let Some(error) = wire.error.filter(ProviderErrorBody::is_set) {
            let mut event = CanonicalEvent::new(EventKind::Error);
            event.error = Some(error);
            events.push(event);
            return Ok(events);
        }

        if !self.announced_snapshot && !wire.id.is_empty() {
            self.announced_snapshot = true;
            let mut event = CanonicalEvent::new(EventKind::Created);
            event.response = Some(ResponseSnapshot {
                id: wire.id.clone(),
                model: wire.model.clone(),
                created_at: wire.created,
                ..ResponseSnapshot::default()
            });
            events.push(event);
        }

        for choice in wire.choices {
            let delta = choice.delta.unwrap_or_default();
            let reasoning = delta
                .reasoning_content
                .filter(|text| !text.is_empty())
                .or(delta.reasoning.filter(|text| !text.is_empty()));
            if let Some(reasoning) = reasoning {
                events.push(CanonicalEvent::with_delta(
                    EventKind::ReasoningSummaryDelta,
                    reasoning,
                ));
            }
            if let Some(content) = delta.content.filter(|text| !text.is_empty()) {
                events.push(CanonicalEvent::with_delta(EventKind::OutputTextDelta, content));
            }
            for (position, call) in delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
                events.push(self.tool_call_event(position, call));
            }
        }

        if let Some(usage) = wire.usage.map(|usage| usage.to_usage()) {
            if !usage.is_empty() {
                events.push(CanonicalEvent::completed(ResponseSnapshot {
                    id: wire.id,
                    model: wire.model,
                    created_at: wire.created,
                    usage: Some(usage),
                    ..ResponseSnapshot::default()
                }));
            }
        }

        for event in &mut events {
            event.passthrough_token.clone_from(&token);
        }
        Ok(events)
    }

    fn tool_call_event(&mut self, position: usize, call: ToolCallWire) -> CanonicalEvent {
        let index = call.index.unwrap_or(position);
        let function = call.function.unwrap_or_default();
        let arguments = function.arguments.unwrap_or_default();

        if let Some(call_id) = self.call_id_by_index.get(&index) {
            let mut event =
                CanonicalEvent::with_delta(EventKind::FunctionCallArgumentsDelta, arguments);
            event.item_id = Some(call_id.clone());
            return event;
        }

        let call_id = call
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("call_{index}"));
        self.call_id_by_index.insert(index, call_id.clone());
        let name = function.name.unwrap_or_default();
        let item = OutputItem::function_call(&call_id, &call_id, &name, &arguments);
        CanonicalEvent::with_item(EventKind::OutputItemAdded, None, item)
    }
}
