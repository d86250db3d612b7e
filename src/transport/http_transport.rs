use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::protocol::canonical::ProviderErrorBody;

const PROXY_CLIENT_CACHE_MAX_ENTRIES: usize = 64;
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// A fully built provider request.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Duration,
    use_env_proxy: bool,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, RelayError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout);

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| RelayError::Transport(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| RelayError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// HTTP client for provider requests. Executes each request exactly once;
/// retries and failover belong to the caller.
pub struct HttpTransport {
    base_client: OnceLock<Arc<reqwest::Client>>,
    proxy_clients: RwLock<FxHashMap<String, Arc<reqwest::Client>>>,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Duration,
    use_env_proxy: bool,
}

impl HttpTransport {
    /// Create a transport with pooling and timeouts from the server config.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };
        Self {
            base_client: OnceLock::new(),
            proxy_clients: RwLock::new(FxHashMap::default()),
            pool_max_idle_per_host: config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            timeout: Duration::from_secs(config.timeout),
            use_env_proxy: config.http_use_env_proxy,
        }
    }

    fn base_reqwest_client(&self) -> Arc<reqwest::Client> {
        if let Some(existing) = self.base_client.get() {
            return existing.clone();
        }
        let built = match build_reqwest_client(
            self.pool_max_idle_per_host,
            self.pool_idle_timeout,
            self.timeout,
            self.use_env_proxy,
            None,
        ) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                tracing::error!(error = %err, "failed to build configured reqwest client, falling back to default client");
                Arc::new(reqwest::Client::new())
            }
        };
        let _ = self.base_client.set(built.clone());
        self.base_client.get().cloned().unwrap_or(built)
    }

    fn client_for_proxy(&self, proxy_url: Option<&str>) -> Result<Arc<reqwest::Client>, RelayError> {
        let Some(proxy_url) = proxy_url else {
            return Ok(self.base_reqwest_client());
        };
        if let Some(existing) = self.proxy_clients.read().get(proxy_url) {
            return Ok(existing.clone());
        }

        let client = build_reqwest_client(
            self.pool_max_idle_per_host,
            self.pool_idle_timeout,
            self.timeout,
            self.use_env_proxy,
            Some(proxy_url),
        )
        .map(Arc::new)?;

        let mut cache = self.proxy_clients.write();
        if let Some(existing) = cache.get(proxy_url) {
            return Ok(existing.clone());
        }
        if cache.len() >= PROXY_CLIENT_CACHE_MAX_ENTRIES {
            cache.clear();
        }
        cache.insert(proxy_url.to_string(), client.clone());
        Ok(client)
    }

    /// POST a provider request and return the successful response for body reading.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] when the request cannot be executed and
    /// [`RelayError::Provider`] carrying the upstream status for non-2xx replies.
    pub async fn send(
        &self,
        request: UpstreamRequest,
        proxy_url: Option<&str>,
    ) -> Result<reqwest::Response, RelayError> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| RelayError::Transport(format!("Invalid upstream URL: {e}")))?;
        let client = self.client_for_proxy(proxy_url)?;

        let mut outbound = reqwest::Request::new(http::Method::POST, url);
        *outbound.headers_mut() = request.headers;
        *outbound.body_mut() = Some(reqwest::Body::from(request.body));

        let response = client
            .execute(outbound)
            .await
            .map_err(|err| RelayError::Transport(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::Transport(format!("Failed to read error body: {e}")))?;
        tracing::debug!(
            status = status.as_u16(),
            body_len = body.len(),
            "upstream returned error status"
        );
        Err(upstream_status_error(status.as_u16(), &body))
    }
}

#[derive(serde::Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorObject>,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum ErrorObject {
    Structured(ProviderErrorBody),
    Text(String),
}

/// Map a non-2xx upstream reply to a provider error, keeping only the
/// message, code and type so internal details do not leak downstream.
#[must_use]
pub fn upstream_status_error(status: u16, body: &[u8]) -> RelayError {
    if let Ok(ErrorEnvelope { error: Some(error) }) = serde_json::from_slice(body) {
        match error {
            ErrorObject::Structured(mut error) if error.is_set() || !error.message.is_empty() => {
                error.message = truncate_message(&error.message);
                return RelayError::from_provider_body(&error, status);
            }
            ErrorObject::Text(message) if !message.is_empty() => {
                return RelayError::provider(truncate_message(&message), "", status);
            }
            _ => {}
        }
    }
    let raw = String::from_utf8_lossy(body);
    let message = if raw.trim().is_empty() {
        format!("upstream returned status {status}")
    } else {
        truncate_message(raw.trim())
    };
    RelayError::provider(message, "", status)
}

fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_status_error_extracts_openai_error() {
        let body = br#"{"error":{"message":"model overloaded","type":"server_error","code":"overloaded"}}"#;
        match upstream_status_error(503, body) {
            RelayError::Provider {
                status,
                code,
                kind,
                message,
            } => {
                assert_eq!(status, 503);
                assert_eq!(code, "overloaded");
                assert_eq!(kind, "server_error");
                assert_eq!(message, "model overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_upstream_status_error_handles_string_error_and_raw_text() {
        let err = upstream_status_error(400, br#"{"error":"bad things"}"#);
        assert_eq!(err.to_string(), "bad things");
        assert_eq!(err.http_status(), http::StatusCode::BAD_REQUEST);

        let err = upstream_status_error(502, b"<html>gateway</html>");
        assert_eq!(err.to_string(), "<html>gateway</html>");

        let err = upstream_status_error(500, b"");
        assert_eq!(err.to_string(), "upstream returned status 500");
    }

    #[test]
    fn test_upstream_status_error_truncates_long_messages() {
        let long = "é".repeat(400);
        let body = serde_json::json!({"error": {"message": long}}).to_string();
        let message = upstream_status_error(500, body.as_bytes()).to_string();
        assert!(message.ends_with("..."));
        assert!(message.len() <= MAX_ERROR_MESSAGE_LEN + 3);
    }

    #[test]
    fn test_transport_caches_proxy_clients() {
        let transport = HttpTransport::new(&ServerConfig::default());
        let first = transport.client_for_proxy(Some("http://127.0.0.1:7890")).unwrap();
        let second = transport.client_for_proxy(Some("http://127.0.0.1:7890")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
