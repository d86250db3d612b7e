//! Upstream body → canonical event stream.
use std::collections::VecDeque;
use std::fmt::Display;

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};

use crate::error::RelayError;
use crate::protocol::canonical::{
    CanonicalEvent, EventKind, OutputItem, ResponseSnapshot, UpstreamWire,
};
use crate::protocol::openai_chat::stream_event::{ChatChunkDecoder, ChunkEvents};
use crate::protocol::openai_chat::ChatCompletionWire;
use crate::protocol::openai_responses::parse_response_document;
use crate::protocol::openai_responses::stream_event::decode_responses_event;

use super::sse::{payload_line_stream, ScannedLine, ScannerLimits};

pub type EventStream = BoxStream<'static, Result<CanonicalEvent, RelayError>>;

/// Shape of an upstream body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    EventStream,
    Json,
}

/// Decide how to read a body from its content type and first bytes.
///
/// A body whose first non-blank bytes are `data:` or `event:` is treated as
/// SSE even when the content type says otherwise.
#[must_use]
pub fn detect_body_kind(content_type: Option<&str>, first_bytes: &[u8]) -> BodyKind {
    if content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("text/event-stream")) {
        return BodyKind::EventStream;
    }
    let start = first_bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(first_bytes.len());
    let head = &first_bytes[start..];
    if head.starts_with(b"data:") || head.starts_with(b"event:") {
        BodyKind::EventStream
    } else {
        BodyKind::Json
    }
}

/// Stateful payload decoder for one upstream wire.
#[derive(Debug)]
pub struct PayloadDecoder {
    wire: UpstreamWire,
    chat: ChatChunkDecoder,
}

impl PayloadDecoder {
    #[must_use]
    pub fn new(wire: UpstreamWire) -> Self {
        Self {
            wire,
            chat: ChatChunkDecoder::new(),
        }
    }

    /// Decode one SSE payload into zero or more events.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MalformedEvent`] when the payload is not valid
    /// JSON for the wire, and [`RelayError::NotImplemented`] for wires that
    /// are only ever passed through.
    pub fn decode(&mut self, payload: &str) -> Result<ChunkEvents, RelayError> {
        let malformed = |err: serde_json::Error| RelayError::MalformedEvent(err.to_string());
        match self.wire {
            UpstreamWire::Responses => Ok(decode_responses_event(payload)
                .map_err(malformed)?
                .into_iter()
                .collect()),
            UpstreamWire::ChatCompletions => self.chat.decode(payload).map_err(malformed),
            UpstreamWire::AnthropicMessages | UpstreamWire::GeminiNative => Err(
                RelayError::NotImplemented("event decoding for passthrough-only wires".into()),
            ),
        }
    }
}

struct DecodeState<L> {
    lines: std::pin::Pin<Box<L>>,
    decoder: PayloadDecoder,
    pending: VecDeque<CanonicalEvent>,
}

/// Decode an SSE body into canonical events.
///
/// Malformed payloads are logged and skipped; a fatal read error is yielded
/// once and ends the stream.
pub fn canonical_event_stream<S, E>(
    body: S,
    wire: UpstreamWire,
    limits: ScannerLimits,
) -> impl Stream<Item = Result<CanonicalEvent, RelayError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        lines: Box::pin(payload_line_stream(body, limits)),
        decoder: PayloadDecoder::new(wire),
        pending: VecDeque::new(),
    };
    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            match state.lines.as_mut().next().await? {
                Ok(ScannedLine::Done) => return None,
                Ok(ScannedLine::Payload(payload)) => match state.decoder.decode(&payload) {
                    Ok(events) => state.pending.extend(events),
                    Err(RelayError::MalformedEvent(reason)) => {
                        tracing::warn!(
                            reason = %reason,
                            payload_len = payload.len(),
                            "skipping malformed upstream event"
                        );
                    }
                    Err(err) => return Some((Err(err), state)),
                },
                Err(err) => return Some((Err(err), state)),
            }
        }
    })
}

/// Decode one buffered JSON document into canonical events.
///
/// # Errors
///
/// Returns [`RelayError::BadResponseBody`] when the document cannot be parsed.
pub fn decode_document(wire: UpstreamWire, body: &[u8]) -> Result<Vec<CanonicalEvent>, RelayError> {
    let bad_body = |err: serde_json::Error| {
        RelayError::BadResponseBody(format!("failed to parse upstream response: {err}"))
    };
    match wire {
        UpstreamWire::Responses => {
            let snapshot = parse_response_document(body).map_err(bad_body)?;
            let kind = if snapshot.provider_error().is_some() {
                EventKind::Failed
            } else {
                EventKind::Completed
            };
            let mut event = CanonicalEvent::new(kind);
            event.error = snapshot.provider_error().cloned();
            event.response = Some(snapshot);
            Ok(vec![event])
        }
        UpstreamWire::ChatCompletions => {
            let document: ChatCompletionWire = serde_json::from_slice(body).map_err(bad_body)?;
            Ok(chat_document_events(document))
        }
        UpstreamWire::AnthropicMessages | UpstreamWire::GeminiNative => Err(
            RelayError::NotImplemented("document decoding for passthrough-only wires".into()),
        ),
    }
}

fn chat_document_events(document: ChatCompletionWire) -> Vec<CanonicalEvent> {
    if let Some(error) = document.error.filter(|err| err.is_set()) {
        let mut event = CanonicalEvent::new(EventKind::Error);
        event.error = Some(error);
        return vec![event];
    }
    let mut events = Vec::new();
    for choice in document.choices {
        let Some(message) = choice.message else { continue };
        let reasoning = message
            .reasoning_content
            .clone()
            .filter(|text| !text.is_empty())
            .or_else(|| message.reasoning.clone().filter(|text| !text.is_empty()));
        if let Some(reasoning) = reasoning {
            events.push(CanonicalEvent::with_delta(
                EventKind::ReasoningSummaryDelta,
                reasoning,
            ));
        }
        let text = match &message.content {
            Some(serde_json::Value::String(text)) => text.clone(),
            _ => String::new(),
        };
        if !text.is_empty() {
            events.push(CanonicalEvent::with_delta(EventKind::OutputTextDelta, text));
        }
        for call in message.tool_calls.unwrap_or_default() {
            let id = call.get("id").and_then(serde_json::Value::as_str).unwrap_or_default();
            let function = call.get("function");
            let field = |key: &str| {
                function
                    .and_then(|f| f.get(key))
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let item = OutputItem::function_call(id, id, &field("name"), &field("arguments"));
            events.push(CanonicalEvent::with_item(EventKind::OutputItemDone, None, item));
        }
    }
    events.push(CanonicalEvent::completed(ResponseSnapshot {
        usage: document.usage.map(|usage| usage.to_usage()),
        ..ResponseSnapshot::default()
    }));
    events
}

/// Open an upstream body as a canonical event stream, whatever its shape.
///
/// The first chunk is inspected to tell SSE from a single JSON document.
/// JSON documents are buffered up to the scanner cap.
///
/// # Errors
///
/// Returns a transport-level [`RelayError::BadResponseBody`] when the body
/// cannot be read or exceeds the cap.
pub async fn open_event_stream<S, E>(
    body: S,
    content_type: Option<&str>,
    wire: UpstreamWire,
    limits: ScannerLimits,
) -> Result<EventStream, RelayError>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut body = Box::pin(body);
    let mut head = BytesMut::new();
    while head.iter().all(u8::is_ascii_whitespace) {
        match body.next().await {
            Some(Ok(chunk)) => head.extend_from_slice(&chunk),
            Some(Err(err)) => {
                return Err(RelayError::BadResponseBody(format!(
                    "failed to read upstream body: {err}"
                )))
            }
            None => break,
        }
    }
    let head = head.freeze();

    match detect_body_kind(content_type, &head) {
        BodyKind::EventStream => {
            let rest = futures_util::stream::once(async move { Ok::<Bytes, E>(head) }).chain(body);
            Ok(canonical_event_stream(rest, wire, limits).boxed())
        }
        BodyKind::Json => {
            let mut document = BytesMut::from(&head[..]);
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|err| {
                    RelayError::BadResponseBody(format!("failed to read upstream body: {err}"))
                })?;
                if document.len() + chunk.len() > limits.max_line_bytes {
                    return Err(RelayError::BadResponseBody(format!(
                        "upstream body exceeds {} bytes",
                        limits.max_line_bytes
                    )));
                }
                document.extend_from_slice(&chunk);
            }
            let events = decode_document(wire, &document)?;
            Ok(futures_util::stream::iter(events.into_iter().map(Ok)).boxed())
        }
    }
}
