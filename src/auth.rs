use crate::config::AppConfig;
use crate::error::RelayError;
use crate::protocol::canonical::IngressApi;
use http::header::{HeaderName, AUTHORIZATION};
use rustc_hash::FxHashMap;

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
const X_GOOG_API_KEY: HeaderName = HeaderName::from_static("x-goog-api-key");

/// Who a request is billed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: u64,
    pub token_id: u64,
}

/// Key index used in hot-path authentication.
pub enum AllowedClientKeys {
    Empty,
    Single {
        raw: Box<str>,
        identity: ClientIdentity,
    },
    Multiple(FxHashMap<String, ClientIdentity>),
}

/// Extract the API key from request headers, based on the ingress API convention.
///
/// - `OpenAiChat` / `OpenAiResponses`: `Authorization: Bearer <key>`
/// - Anthropic: `x-api-key: <key>`, then `Authorization: Bearer <key>`
/// - Gemini: `x-goog-api-key: <key>` first, then `Authorization: Bearer <key>`
///
/// # Errors
///
/// Returns `RelayError::Auth` when no expected API key header is present.
pub fn extract_api_key(ingress: IngressApi, headers: &http::HeaderMap) -> Result<&str, RelayError> {
    let bearer = || {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
    };
    let key = match ingress {
        IngressApi::Anthropic => headers
            .get(X_API_KEY)
            .and_then(|v| v.to_str().ok())
            .or_else(bearer),
        IngressApi::Gemini => headers
            .get(X_GOOG_API_KEY)
            .and_then(|v| v.to_str().ok())
            .or_else(bearer),
        IngressApi::OpenAiChat | IngressApi::OpenAiResponses => bearer(),
    };

    key.map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| RelayError::Auth("Missing API key".to_string()))
}

/// Authenticate an incoming request and resolve the ids it is billed to.
///
/// # Errors
///
/// Returns `RelayError::Auth` when the API key is missing or invalid.
pub fn authenticate(
    ingress: IngressApi,
    headers: &http::HeaderMap,
    allowed_keys: &AllowedClientKeys,
) -> Result<ClientIdentity, RelayError> {
    let client_key = extract_api_key(ingress, headers)?;
    let identity = match allowed_keys {
        AllowedClientKeys::Single { raw, identity } => {
            (raw.as_ref() == client_key).then_some(*identity)
        }
        AllowedClientKeys::Multiple(index) => index.get(client_key).copied(),
        AllowedClientKeys::Empty => None,
    };
    identity.ok_or_else(|| RelayError::Auth("Invalid API key".to_string()))
}

/// Build the key index for the configured client keys.
#[must_use]
pub fn build_allowed_key_set(config: &AppConfig) -> AllowedClientKeys {
    let mut index: FxHashMap<String, ClientIdentity> = config
        .client_authentication
        .allowed_keys
        .iter()
        .map(|entry| {
            let (user_id, token_id) = entry.ids();
            (entry.key().to_string(), ClientIdentity { user_id, token_id })
        })
        .collect();

    match index.len() {
        0 => AllowedClientKeys::Empty,
        1 => match index.drain().next() {
            Some((raw, identity)) => AllowedClientKeys::Single {
                raw: raw.into_boxed_str(),
                identity,
            },
            None => AllowedClientKeys::Empty,
        },
        _ => AllowedClientKeys::Multiple(index),
    }
}
