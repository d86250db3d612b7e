use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::health;
use crate::api::relay::{handle, IngressCall};
use crate::protocol::canonical::IngressApi;
use crate::state::AppState;

const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
enum RouteMatch<'a> {
    Health,
    Ingress(IngressApi),
    Gemini { model_action: &'a str },
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching ingress handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let route = match_route(&parts.method, parts.uri.path(), base_path.as_ref());

    let (ingress, gemini_model_action) = match route {
        RouteMatch::Health => return Ok(health::health_handler(&state).into_response()),
        RouteMatch::MethodNotAllowed => return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
        RouteMatch::NotFound => return Ok(StatusCode::NOT_FOUND.into_response()),
        RouteMatch::Ingress(ingress) => (ingress, None),
        RouteMatch::Gemini { model_action } => (IngressApi::Gemini, Some(model_action.to_string())),
    };

    let body = match read_request_body(body).await {
        Ok(bytes) => bytes,
        Err(response) => return Ok(response),
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path(), |value| value.as_str());
    let path = strip_base_path(path_and_query, base_path.as_ref())
        .unwrap_or(path_and_query)
        .to_string();

    let call = IngressCall {
        ingress,
        headers: parts.headers,
        path,
        body,
        gemini_model_action,
    };
    Ok(handle(state, call).await)
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

async fn read_request_body(body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large (max 2MiB)",
            )
                .into_response()
        })
}

fn match_route<'a>(method: &Method, path: &'a str, base_path: &str) -> RouteMatch<'a> {
    let Some(path) = strip_base_path(path, base_path) else {
        return RouteMatch::NotFound;
    };

    let (route, allowed) = match path {
        "/" => (RouteMatch::Health, Method::GET),
        "/v1/chat/completions" => (RouteMatch::Ingress(IngressApi::OpenAiChat), Method::POST),
        "/v1/responses" => (RouteMatch::Ingress(IngressApi::OpenAiResponses), Method::POST),
        "/v1/messages" => (RouteMatch::Ingress(IngressApi::Anthropic), Method::POST),
        _ => match path.strip_prefix("/v1beta/models/") {
            Some(model_action) if !model_action.is_empty() => {
                (RouteMatch::Gemini { model_action }, Method::POST)
            }
            _ => return RouteMatch::NotFound,
        },
    };
    if *method == allowed {
        route
    } else {
        RouteMatch::MethodNotAllowed
    }
}

fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    if base_path.is_empty() {
        return Some(path);
    }

    let remainder = path.strip_prefix(base_path)?;
    if remainder.is_empty() {
        Some("/")
    } else if remainder.starts_with('/') || remainder.starts_with('?') {
        Some(remainder)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_known_routes() {
        assert_eq!(match_route(&Method::GET, "/", ""), RouteMatch::Health);
        assert_eq!(
            match_route(&Method::POST, "/v1/chat/completions", ""),
            RouteMatch::Ingress(IngressApi::OpenAiChat)
        );
        assert_eq!(
            match_route(&Method::POST, "/v1/messages", ""),
            RouteMatch::Ingress(IngressApi::Anthropic)
        );
        assert_eq!(
            match_route(&Method::POST, "/v1beta/models/gemini-pro:generateContent", ""),
            RouteMatch::Gemini {
                model_action: "gemini-pro:generateContent"
            }
        );
    }

    #[test]
    fn test_match_wrong_method_and_unknown_path() {
        assert_eq!(
            match_route(&Method::GET, "/v1/responses", ""),
            RouteMatch::MethodNotAllowed
        );
        assert_eq!(match_route(&Method::POST, "/v1/models", ""), RouteMatch::NotFound);
        assert_eq!(match_route(&Method::POST, "/v1beta/models/", ""), RouteMatch::NotFound);
    }

    #[test]
    fn test_base_path_is_stripped() {
        assert_eq!(normalize_base_path("relay/"), "/relay");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(
            match_route(&Method::POST, "/relay/v1/messages", "/relay"),
            RouteMatch::Ingress(IngressApi::Anthropic)
        );
        assert_eq!(match_route(&Method::POST, "/relayv1/messages", "/relay"), RouteMatch::NotFound);
        assert_eq!(
            strip_base_path("/relay/v1/messages?beta=true", "/relay"),
            Some("/v1/messages?beta=true")
        );
    }
}
