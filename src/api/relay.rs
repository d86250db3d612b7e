//! Shared ingress handler: authenticate, route, plan, send, then stream or
//! return the relayed body.
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::auth::ClientIdentity;
use crate::error::{into_axum_response, RelayError};
use crate::history::{
    assistant_message, conversation_id, messages_from_request, response_summary, spawn_save,
    ConversationRecord, ConversationSink,
};
use crate::observability::log_request_complete;
use crate::observability::metrics::{MetricsRecorder, Outcome, RollingMetrics};
use crate::observability::token_counter::estimate_prompt_tokens;
use crate::protocol::canonical::IngressApi;
use crate::relay::{
    error_frame, relay_body, Adaptor, Downstream, InboundRequest, Pairing, RelayContext,
    RelayOutcome,
};
use crate::state::AppState;
use crate::util::unix_now_secs;

const GENERATE_CONTENT: &str = "generateContent";
const STREAM_GENERATE_CONTENT: &str = "streamGenerateContent";

/// A routed ingress call with its raw body.
pub struct IngressCall {
    pub ingress: IngressApi,
    pub headers: http::HeaderMap,
    /// Path and query without the base path.
    pub path: String,
    pub body: Bytes,
    /// `{model}:{action}` for native Gemini routes.
    pub gemini_model_action: Option<String>,
}

/// Serve one ingress call, rendering any error in the ingress envelope.
pub async fn handle(state: Arc<AppState>, call: IngressCall) -> Response {
    let ingress = call.ingress;
    match serve(state, call).await {
        Ok(response) => response,
        Err(err) => into_axum_response(&err, ingress),
    }
}

async fn serve(state: Arc<AppState>, call: IngressCall) -> Result<Response, RelayError> {
    let started = Instant::now();
    let ingress = call.ingress;
    let identity = state.authenticate(ingress, &call.headers)?;

    let body: Value = serde_json::from_slice(&call.body)
        .map_err(|err| RelayError::InvalidRequest(format!("invalid JSON body: {err}")))?;
    if !body.is_object() {
        return Err(RelayError::InvalidRequest(
            "request body must be a JSON object".to_string(),
        ));
    }

    let gemini = call
        .gemini_model_action
        .as_deref()
        .map(split_model_action)
        .transpose()?;
    let model = match gemini {
        Some((model, _)) => model.to_string(),
        None => body
            .get("model")
            .and_then(Value::as_str)
            .filter(|model| !model.is_empty())
            .ok_or_else(|| RelayError::InvalidRequest("model is required".to_string()))?
            .to_string(),
    };
    let stream = match gemini {
        Some((_, action)) => action == STREAM_GENERATE_CONTENT,
        None => body.get("stream").and_then(Value::as_bool).unwrap_or(false),
    };
    let include_usage = body
        .pointer("/stream_options/include_usage")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let ids = state.mint_request_ids();
    let (target, channel) = state.route(&model, ids.seq)?;
    let upstream_model = target.upstream_model.to_string();
    let channel_name = channel.config.name.clone();
    let services = state.services.clone();
    let prompt_estimate =
        estimate_prompt_tokens(&body, &upstream_model, services.tokenizer.as_ref());

    let plan = channel.adaptor.plan(&InboundRequest {
        ingress,
        path: &call.path,
        body: &body,
        upstream_model: &upstream_model,
        stream,
        gemini_action: gemini.map(|(_, action)| action),
    })?;
    let pairing = plan.pairing;
    tracing::debug!(
        request_id = %ids.request_id,
        model = %model,
        upstream_model = %upstream_model,
        channel = %channel_name,
        provider = ?channel.adaptor.provider(),
        ?pairing,
        "dispatching request"
    );

    let response = match state
        .transport
        .send(plan.upstream, channel.config.proxy.as_deref())
        .await
    {
        Ok(response) => response,
        Err(err) => {
            services.metrics.observe(
                &channel_name,
                started.elapsed(),
                0,
                &error_outcome(&err),
            );
            return Err(err);
        }
    };
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let ctx = RelayContext {
        ingress,
        pairing,
        model: model.clone(),
        prompt_estimate,
        include_usage,
        thinking_to_content: channel.config.thinking_to_content,
        limits: state.config.stream.scanner_limits(),
        upstream_status: response.status().as_u16(),
        response_id: ids.completion_id,
        created: unix_now_secs(),
    };
    let ledger = RequestLedger {
        started,
        ingress,
        model,
        channel: channel_name,
        identity,
        request_id: ids.request_id,
        response_id: ctx.response_id.clone(),
        request_body: body,
        metrics: Arc::clone(&services.metrics),
        history: services.history.clone(),
    };

    let (tx, mut rx) = mpsc::channel(state.config.stream.downstream_channel_capacity.max(1));
    let tokenizer = Arc::clone(&services.tokenizer);
    tokio::spawn(async move {
        let outcome = relay_body(
            &ctx,
            response.bytes_stream(),
            content_type.as_deref(),
            tokenizer.as_ref(),
            &tx,
        )
        .await;
        drop(tx);
        ledger.finish(outcome);
    });

    match rx.recv().await {
        None => Err(RelayError::provider(
            "no response received from upstream",
            "empty_response",
            500,
        )),
        Some(Downstream::Failed(err)) => Err(err),
        Some(Downstream::Frame(first)) if pairing.is_stream() => {
            Ok(sse_response(first, rx, ingress))
        }
        Some(Downstream::Frame(document)) => Ok(json_response(document)),
    }
}

fn split_model_action(model_action: &str) -> Result<(&str, &str), RelayError> {
    let (model, action) = model_action.rsplit_once(':').ok_or_else(|| {
        RelayError::InvalidRequest(format!("expected '{{model}}:{{action}}', got '{model_action}'"))
    })?;
    if model.is_empty() {
        return Err(RelayError::InvalidRequest("model is required".to_string()));
    }
    match action {
        GENERATE_CONTENT | STREAM_GENERATE_CONTENT => Ok((model, action)),
        other => Err(RelayError::NotImplemented(format!(
            "gemini action '{other}' is not supported"
        ))),
    }
}

fn sse_response(first: Bytes, rx: mpsc::Receiver<Downstream>, ingress: IngressApi) -> Response {
    let rest = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|message| (message, rx))
    })
    .map(move |message| match message {
        Downstream::Frame(frame) => frame,
        Downstream::Failed(err) => error_frame(&err, ingress),
    });
    let frames = futures_util::stream::once(async move { first })
        .chain(rest)
        .map(Ok::<Bytes, Infallible>);

    let mut response = Response::new(Body::from_stream(frames));
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}

fn json_response(document: Bytes) -> Response {
    let mut response = Response::new(Body::from(document));
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

fn error_outcome(err: &RelayError) -> Outcome {
    Outcome::Error {
        status: err.http_status().as_u16(),
        kind: err.kind_name().to_string(),
        detail: err.to_string(),
    }
}

/// Everything needed to account for a request after its body is relayed.
struct RequestLedger {
    started: Instant,
    ingress: IngressApi,
    model: String,
    channel: String,
    identity: ClientIdentity,
    request_id: String,
    response_id: String,
    request_body: Value,
    metrics: Arc<RollingMetrics>,
    history: Option<Arc<dyn ConversationSink>>,
}

impl RequestLedger {
    fn finish(self, outcome: RelayOutcome) {
        let outcome_kind = outcome
            .error
            .as_ref()
            .map_or(Outcome::Success, error_outcome);
        self.metrics.observe(
            &self.channel,
            self.started.elapsed(),
            outcome.usage.total_tokens,
            &outcome_kind,
        );
        if outcome.error.is_some() {
            return;
        }
        if outcome.cancelled {
            tracing::info!(
                model = %self.model,
                channel = %self.channel,
                completion_tokens = outcome.usage.completion_tokens,
                "client disconnected before the response finished"
            );
        }
        log_request_complete(&self.model, &self.channel, &outcome.usage, self.started);

        let Some(history) = self.history else {
            return;
        };
        let response = outcome
            .document
            .as_deref()
            .and_then(|document| serde_json::from_slice(document).ok())
            .unwrap_or_else(|| {
                response_summary(&self.response_id, &self.model, &outcome.text, &outcome.usage)
            });
        let mut messages = messages_from_request(self.ingress, &self.request_body);
        messages.push(assistant_message(&outcome.text, None, "stop"));
        spawn_save(
            history,
            ConversationRecord {
                conversation_id: conversation_id(&self.request_id),
                messages,
                response,
                model: self.model,
                user_id: self.identity.user_id,
                token_id: self.identity.token_id,
                channel_id: self.channel,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_model_action() {
        assert_eq!(
            split_model_action("gemini-2.0-flash:streamGenerateContent").unwrap(),
            ("gemini-2.0-flash", "streamGenerateContent")
        );
        assert!(matches!(
            split_model_action("gemini-2.0-flash:countTokens").unwrap_err(),
            RelayError::NotImplemented(_)
        ));
        assert!(split_model_action("gemini-2.0-flash").is_err());
        assert!(split_model_action(":generateContent").is_err());
    }

    #[test]
    fn test_error_outcome_keeps_provider_status() {
        let err = RelayError::provider("slow down", "rate_limit_exceeded", 429);
        match error_outcome(&err) {
            Outcome::Error { status, kind, .. } => {
                assert_eq!(status, 429);
                assert_eq!(kind, "provider");
            }
            Outcome::Success => panic!("expected error outcome"),
        }
    }
}
