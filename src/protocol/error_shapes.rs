//! Error envelopes in each ingress dialect.
use serde::Serialize;

use crate::error::{ErrorCategory, RelayError};
use crate::protocol::canonical::IngressApi;

#[derive(Serialize)]
struct OpenAiEnvelope<'a> {
    error: OpenAiError<'a>,
}

#[derive(Serialize)]
struct OpenAiError<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    code: &'a str,
    param: Option<&'a str>,
}

#[derive(Serialize)]
struct AnthropicEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    error: AnthropicError<'a>,
}

#[derive(Serialize)]
struct AnthropicError<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct GeminiEnvelope<'a> {
    error: GeminiError<'a>,
}

#[derive(Serialize)]
struct GeminiError<'a> {
    code: u16,
    message: &'a str,
    status: &'a str,
}

fn openai_type(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest | ErrorCategory::NotFound => "invalid_request_error",
        ErrorCategory::Authentication => "authentication_error",
        ErrorCategory::Permission => "permission_error",
        ErrorCategory::RateLimit => "rate_limit_error",
        ErrorCategory::NotImplemented => "not_implemented",
        ErrorCategory::ServerError | ErrorCategory::Unknown => "server_error",
    }
}

fn openai_code(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest => "invalid_request",
        ErrorCategory::NotFound => "model_not_found",
        ErrorCategory::Authentication => "invalid_api_key",
        ErrorCategory::Permission => "permission_denied",
        ErrorCategory::RateLimit => "rate_limit_exceeded",
        ErrorCategory::NotImplemented => "convert_request_failed",
        ErrorCategory::ServerError | ErrorCategory::Unknown => "server_error",
    }
}

fn anthropic_type(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest | ErrorCategory::NotImplemented => "invalid_request_error",
        ErrorCategory::NotFound => "not_found_error",
        ErrorCategory::Authentication => "authentication_error",
        ErrorCategory::Permission => "permission_error",
        ErrorCategory::RateLimit => "rate_limit_error",
        ErrorCategory::ServerError | ErrorCategory::Unknown => "api_error",
    }
}

fn gemini_status(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest => "INVALID_ARGUMENT",
        ErrorCategory::NotFound => "NOT_FOUND",
        ErrorCategory::Authentication => "UNAUTHENTICATED",
        ErrorCategory::Permission => "PERMISSION_DENIED",
        ErrorCategory::RateLimit => "RESOURCE_EXHAUSTED",
        ErrorCategory::NotImplemented => "UNIMPLEMENTED",
        ErrorCategory::ServerError | ErrorCategory::Unknown => "INTERNAL",
    }
}

/// Provider-reported `(kind, code)`, empty strings when unknown.
fn provider_labels(err: &RelayError) -> (&str, &str) {
    match err {
        RelayError::Provider { kind, code, .. } => (kind, code),
        _ => ("", ""),
    }
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

/// Render `err` as the JSON error body `ingress` clients expect.
///
/// Upstream error types and codes pass through when the provider supplied
/// them; otherwise they derive from the error category.
pub(crate) fn error_envelope(
    err: &RelayError,
    ingress: IngressApi,
    status: http::StatusCode,
) -> serde_json::Value {
    let cat = err.category();
    let message = err.to_string();
    let (provider_kind, provider_code) = provider_labels(err);

    let rendered = match ingress {
        IngressApi::OpenAiChat | IngressApi::OpenAiResponses => {
            serde_json::to_value(OpenAiEnvelope {
                error: OpenAiError {
                    message: &message,
                    kind: non_empty(provider_kind, openai_type(cat)),
                    code: non_empty(provider_code, openai_code(cat)),
                    param: None,
                },
            })
        }
        IngressApi::Anthropic => serde_json::to_value(AnthropicEnvelope {
            kind: "error",
            error: AnthropicError {
                kind: non_empty(provider_kind, anthropic_type(cat)),
                message: &message,
            },
        }),
        IngressApi::Gemini => serde_json::to_value(GeminiEnvelope {
            error: GeminiError {
                code: status.as_u16(),
                message: &message,
                status: gemini_status(cat),
            },
        }),
    };
    rendered.unwrap_or_else(|_| serde_json::json!({ "error": { "message": message } }))
}
