//! Pumps one upstream body through its decoder/sink pairing into a bounded
//! downstream channel.
use std::fmt::Display;
use std::future::Future;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::{format_error, RelayError};
use crate::observability::token_counter::Tokenizer;
use crate::protocol::canonical::{IngressApi, UpstreamWire, Usage};
use crate::sink::{
    probe_document, synthesize_chat_completion, synthesize_response, ChatChunkSink,
    ChatCompletionIdentity, ChatStreamOptions, PassthroughSink,
};
use crate::stream::sse::{data_frame, event_frame, raw_frame_stream};
use crate::stream::usage::extract_message_text;
use crate::stream::{canonical_event_stream, open_event_stream, ScannerLimits, TranslationState};

use super::adaptor::Pairing;

/// Per-request settings of the relay loop.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub ingress: IngressApi,
    pub pairing: Pairing,
    /// Model name reported to the client.
    pub model: String,
    pub prompt_estimate: u64,
    pub include_usage: bool,
    pub thinking_to_content: bool,
    pub limits: ScannerLimits,
    /// HTTP status of the upstream response, attached to in-stream errors.
    pub upstream_status: u16,
    /// Id of synthesized chat completions and chunks.
    pub response_id: String,
    pub created: u64,
}

/// One message to the client writer.
#[derive(Debug)]
pub enum Downstream {
    Frame(Bytes),
    /// Ends the response. Before any frame this becomes an HTTP error,
    /// afterwards one error frame.
    Failed(RelayError),
}

/// What one relayed request produced, for billing, metrics and history.
#[derive(Debug, Default)]
pub struct RelayOutcome {
    pub usage: Usage,
    /// Visible assistant text.
    pub text: String,
    /// The JSON body sent to a non-stream client.
    pub document: Option<Bytes>,
    pub error: Option<RelayError>,
    /// The client went away before the response finished.
    pub cancelled: bool,
}

impl RelayOutcome {
    fn failed(err: RelayError) -> Self {
        Self {
            error: Some(err),
            ..Self::default()
        }
    }

    fn cancelled(usage: Usage, text: String) -> Self {
        Self {
            usage,
            text,
            cancelled: true,
            ..Self::default()
        }
    }
}

/// Encode an error as one SSE frame in the ingress envelope.
#[must_use]
pub fn error_frame(err: &RelayError, ingress: IngressApi) -> Bytes {
    let (_, body) = format_error(err, ingress);
    let json = body.to_string();
    match ingress {
        IngressApi::Anthropic => event_frame("error", json.as_bytes()),
        IngressApi::OpenAiChat | IngressApi::OpenAiResponses | IngressApi::Gemini => {
            data_frame(json.as_bytes())
        }
    }
}

/// A folded document ready to send: body, usage and visible text.
type Document = (Bytes, Usage, String);

enum Folded {
    Ready(Document),
    Cancelled(RelayOutcome),
}

/// Resolve `work`, or `None` once the client has gone away. Ready work wins
/// over a closed channel so frames already received are still accounted.
async fn unless_closed<F: Future>(tx: &mpsc::Sender<Downstream>, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        output = work => Some(output),
        () = tx.closed() => None,
    }
}

/// Relay a successful upstream body to `tx` and report the outcome.
///
/// Errors never escape: they are sent as [`Downstream::Failed`] and
/// recorded in the outcome. A closed channel stops the loop, drops the
/// upstream body and returns the usage accumulated so far, even while the
/// upstream is silent.
pub async fn relay_body<S, E>(
    ctx: &RelayContext,
    body: S,
    content_type: Option<&str>,
    tokenizer: &dyn Tokenizer,
    tx: &mpsc::Sender<Downstream>,
) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    match ctx.pairing {
        Pairing::ResponsesToChatStream => pump_chat_stream(ctx, body, tokenizer, tx).await,
        Pairing::StreamPassthrough(wire) => pump_passthrough(ctx, wire, body, tokenizer, tx).await,
        Pairing::DocumentPassthrough(wire) => {
            let collect = collect_body(body, ctx.limits.max_line_bytes);
            let Some(collected) = unless_closed(tx, collect).await else {
                return prompt_only_cancel(ctx);
            };
            let result = match collected {
                Ok(document) => {
                    probe_document(wire, &document, ctx.prompt_estimate, &ctx.model, tokenizer)
                        .map(|(probe, usage)| (document, usage, probe.collected_text()))
                }
                Err(err) => Err(err),
            };
            deliver_document(result, tx).await
        }
        Pairing::ResponsesToChatDocument | Pairing::ResponsesToResponseDocument => {
            match fold_responses(ctx, body, content_type, tokenizer, tx).await {
                Ok(Folded::Ready(document)) => deliver_document(Ok(document), tx).await,
                Ok(Folded::Cancelled(outcome)) => outcome,
                Err(err) => fail(err, tx).await,
            }
        }
    }
}

/// Outcome for a client that left before any upstream output was read.
fn prompt_only_cancel(ctx: &RelayContext) -> RelayOutcome {
    let prompt = ctx.prompt_estimate;
    RelayOutcome::cancelled(Usage::new(prompt, 0, prompt), String::new())
}

async fn pump_chat_stream<S, E>(
    ctx: &RelayContext,
    body: S,
    tokenizer: &dyn Tokenizer,
    tx: &mpsc::Sender<Downstream>,
) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut sink = ChatChunkSink::new(ChatStreamOptions {
        id: ctx.response_id.clone(),
        model: ctx.model.clone(),
        created: ctx.created,
        include_usage: ctx.include_usage,
        thinking_to_content: ctx.thinking_to_content,
    })
    .with_upstream_status(ctx.upstream_status);
    let cancelled = |sink: &ChatChunkSink| {
        let usage = sink.final_usage(ctx.prompt_estimate, tokenizer);
        RelayOutcome::cancelled(usage, sink.state().deltas.text().to_string())
    };
    let events = canonical_event_stream(body, UpstreamWire::Responses, ctx.limits);
    futures_util::pin_mut!(events);

    loop {
        let Some(next) = unless_closed(tx, events.next()).await else {
            return cancelled(&sink);
        };
        let Some(event) = next else { break };
        match event.and_then(|event| sink.on_event(event)) {
            Ok(frames) => {
                for frame in frames {
                    if tx.send(Downstream::Frame(frame)).await.is_err() {
                        return cancelled(&sink);
                    }
                }
            }
            Err(err) => return fail(err, tx).await,
        }
    }

    match sink.finish(ctx.prompt_estimate, tokenizer) {
        Ok((frames, usage)) => {
            let text = sink.state().deltas.text().to_string();
            for frame in frames {
                if tx.send(Downstream::Frame(frame)).await.is_err() {
                    return RelayOutcome::cancelled(usage, text);
                }
            }
            RelayOutcome {
                usage,
                text,
                ..RelayOutcome::default()
            }
        }
        Err(err) => fail(err, tx).await,
    }
}

async fn pump_passthrough<S, E>(
    ctx: &RelayContext,
    wire: UpstreamWire,
    body: S,
    tokenizer: &dyn Tokenizer,
    tx: &mpsc::Sender<Downstream>,
) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut sink = PassthroughSink::new(wire, ctx.thinking_to_content)
        .with_client_usage(ctx.include_usage);
    let cancelled = |sink: &PassthroughSink| {
        let probe = sink.probe();
        let usage = probe.usage(ctx.prompt_estimate, &ctx.model, tokenizer);
        RelayOutcome::cancelled(usage, probe.collected_text())
    };
    let frames = raw_frame_stream(body, ctx.limits);
    futures_util::pin_mut!(frames);

    loop {
        let Some(next) = unless_closed(tx, frames.next()).await else {
            return cancelled(&sink);
        };
        let raw = match next {
            Some(Ok(raw)) => raw,
            Some(Err(err)) => return fail(err, tx).await,
            None => break,
        };
        for frame in sink.on_frame(raw) {
            if tx.send(Downstream::Frame(frame)).await.is_err() {
                return cancelled(&sink);
            }
        }
    }

    match sink.finish(ctx.prompt_estimate, &ctx.model, tokenizer) {
        Ok((frames, usage)) => {
            let text = sink.probe().collected_text();
            for frame in frames {
                if tx.send(Downstream::Frame(frame)).await.is_err() {
                    return RelayOutcome::cancelled(usage, text);
                }
            }
            RelayOutcome {
                usage,
                text,
                ..RelayOutcome::default()
            }
        }
        Err(err) => fail(err, tx).await,
    }
}

/// Fold a Responses body (stream or document) into one client document.
async fn fold_responses<S, E>(
    ctx: &RelayContext,
    body: S,
    content_type: Option<&str>,
    tokenizer: &dyn Tokenizer,
    tx: &mpsc::Sender<Downstream>,
) -> Result<Folded, RelayError>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let opened = open_event_stream(body, content_type, UpstreamWire::Responses, ctx.limits);
    let Some(opened) = unless_closed(tx, opened).await else {
        return Ok(Folded::Cancelled(prompt_only_cancel(ctx)));
    };
    let mut events = opened?;
    let mut state =
        TranslationState::new(ctx.thinking_to_content).with_upstream_status(ctx.upstream_status);
    loop {
        let Some(next) = unless_closed(tx, events.next()).await else {
            let usage = state.finalize(ctx.prompt_estimate, &ctx.model, tokenizer).usage;
            let text = state.deltas.text().to_string();
            return Ok(Folded::Cancelled(RelayOutcome::cancelled(usage, text)));
        };
        let Some(event) = next else { break };
        state.apply(event?)?;
    }

    let text = if state.deltas.text().is_empty() {
        state
            .completed_snapshot()
            .map(|snapshot| extract_message_text(&snapshot.output))
            .unwrap_or_default()
    } else {
        state.deltas.text().to_string()
    };

    let (document, usage) = match ctx.pairing {
        Pairing::ResponsesToResponseDocument => {
            synthesize_response(&mut state, &ctx.model, ctx.prompt_estimate, tokenizer)?
        }
        _ => synthesize_chat_completion(
            &state,
            ChatCompletionIdentity {
                id: ctx.response_id.clone(),
                model: ctx.model.clone(),
                created: ctx.created,
                thinking_to_content: ctx.thinking_to_content,
            },
            ctx.prompt_estimate,
            tokenizer,
        )?,
    };
    Ok(Folded::Ready((document, usage, text)))
}

async fn deliver_document(
    result: Result<Document, RelayError>,
    tx: &mpsc::Sender<Downstream>,
) -> RelayOutcome {
    match result {
        Ok((document, usage, text)) => {
            let cancelled = tx.send(Downstream::Frame(document.clone())).await.is_err();
            RelayOutcome {
                usage,
                text,
                document: Some(document),
                error: None,
                cancelled,
            }
        }
        Err(err) => fail(err, tx).await,
    }
}

async fn fail(err: RelayError, tx: &mpsc::Sender<Downstream>) -> RelayOutcome {
    tracing::warn!(error = %err, kind = err.kind_name(), "relay aborted");
    let cancelled = tx.send(Downstream::Failed(err.clone())).await.is_err();
    RelayOutcome {
        cancelled,
        ..RelayOutcome::failed(err)
    }
}

async fn collect_body<S, E>(body: S, max_bytes: usize) -> Result<Bytes, RelayError>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    futures_util::pin_mut!(body);
    let mut document = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| {
            RelayError::BadResponseBody(format!("failed to read upstream body: {err}"))
        })?;
        if document.len() + chunk.len() > max_bytes {
            return Err(RelayError::BadResponseBody(format!(
                "upstream body exceeds {max_bytes} bytes"
            )));
        }
        document.extend_from_slice(&chunk);
    }
    Ok(document.freeze())
}
