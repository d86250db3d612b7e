use crate::protocol::canonical::{IngressApi, ProviderErrorBody};
use crate::protocol::error_shapes::error_envelope;

/// Error type shared by the relay engine and its HTTP surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Malformed upstream event: {0}")]
    MalformedEvent(String),
    #[error("{message}")]
    Provider {
        status: u16,
        code: String,
        kind: String,
        message: String,
    },
    #[error("Bad response body: {0}")]
    BadResponseBody(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    RateLimit,
    NotImplemented,
    ServerError,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 413 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        404 => ErrorCategory::NotFound,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

impl RelayError {
    /// Structured error reported by a provider, keeping its status.
    #[must_use]
    pub fn provider(cause: impl Into<String>, code: impl Into<String>, status: u16) -> Self {
        Self::Provider {
            status,
            code: code.into(),
            kind: String::new(),
            message: cause.into(),
        }
    }

    /// Build a provider error from an error object found in an upstream body.
    #[must_use]
    pub fn from_provider_body(body: &ProviderErrorBody, status: u16) -> Self {
        let message = if body.message.is_empty() {
            format!("upstream error: {}", non_empty_or(&body.code, &body.kind))
        } else {
            body.message.clone()
        };
        Self::Provider {
            status,
            code: body.code.clone(),
            kind: body.kind.clone(),
            message,
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            RelayError::Auth(_) => ErrorCategory::Authentication,
            RelayError::NotImplemented(_) => ErrorCategory::NotImplemented,
            RelayError::Config(_)
            | RelayError::Transport(_)
            | RelayError::MalformedEvent(_)
            | RelayError::BadResponseBody(_)
            | RelayError::Serialization(_)
            | RelayError::Persistence(_) => ErrorCategory::ServerError,
            RelayError::Provider { status, .. } => category_from_upstream_status(*status),
        }
    }

    /// HTTP status to send downstream. Provider statuses are preserved.
    #[must_use]
    pub fn http_status(&self) -> http::StatusCode {
        if let RelayError::Provider { status, .. } = self {
            if let Ok(code) = http::StatusCode::from_u16(*status) {
                if code.is_client_error() || code.is_server_error() {
                    return code;
                }
            }
        }
        http_status_for_category(self.category())
    }

    /// Provider error type when known, else a short variant name.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        match self {
            RelayError::Provider { kind, .. } if !kind.is_empty() => kind,
            RelayError::Provider { .. } => "provider",
            RelayError::Config(_) => "config",
            RelayError::Auth(_) => "auth",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::NotImplemented(_) => "not_implemented",
            RelayError::Transport(_) => "transport",
            RelayError::MalformedEvent(_) => "malformed_event",
            RelayError::BadResponseBody(_) => "bad_response_body",
            RelayError::Serialization(_) => "serialization",
            RelayError::Persistence(_) => "persistence",
        }
    }

    /// Whether a caller-side retry or channel failover could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Transport(_) => true,
            RelayError::Provider { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

fn non_empty_or<'a>(first: &'a str, second: &'a str) -> &'a str {
    if first.is_empty() {
        second
    } else {
        first
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::NotFound => http::StatusCode::NOT_FOUND,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::NotImplemented => http::StatusCode::NOT_IMPLEMENTED,
        ErrorCategory::ServerError | ErrorCategory::Unknown => {
            http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Format an error for a given ingress API, returning (`status_code`, JSON body).
#[must_use]
pub fn format_error(err: &RelayError, ingress: IngressApi) -> (http::StatusCode, serde_json::Value) {
    let status = err.http_status();
    (status, error_envelope(err, ingress, status))
}

/// Convert a `RelayError` into an axum response for a specific ingress.
#[must_use]
pub fn into_axum_response(err: &RelayError, ingress: IngressApi) -> axum::response::Response {
    use axum::response::IntoResponse;
    let (status, body) = format_error(err, ingress);
    (status, axum::Json(body)).into_response()
}

/// Default `IntoResponse` implementation uses `OpenAiChat` as the fallback ingress.
/// Real handlers should call [`into_axum_response`] with the correct ingress instead.
impl axum::response::IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        into_axum_response(&self, IngressApi::OpenAiChat)
    }
}
