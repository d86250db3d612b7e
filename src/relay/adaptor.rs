//! Per-provider request building and decoder/sink pairing.
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde_json::{Map, Value};

use crate::config::ChannelConfig;
use crate::error::RelayError;
use crate::protocol::canonical::{IngressApi, ProviderKind, UpstreamWire};
use crate::protocol::openai_chat::request::chat_to_responses_request;
use crate::transport::UpstreamRequest;

const APPLICATION_JSON: &str = "application/json";
const EVENT_STREAM: &str = "text/event-stream";

/// How an upstream body is read and what the client receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pairing {
    /// SSE frames forwarded unchanged while a usage probe listens.
    StreamPassthrough(UpstreamWire),
    /// One JSON document forwarded byte-for-byte.
    DocumentPassthrough(UpstreamWire),
    /// Responses events re-emitted as chat chunks.
    ResponsesToChatStream,
    /// Responses events or document folded into one chat completion.
    ResponsesToChatDocument,
    /// Responses events folded into one Responses object.
    ResponsesToResponseDocument,
}

impl Pairing {
    /// Whether the client receives an event stream.
    #[must_use]
    pub fn is_stream(self) -> bool {
        matches!(self, Self::StreamPassthrough(_) | Self::ResponsesToChatStream)
    }
}

/// An authenticated client request, already routed to a channel.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub ingress: IngressApi,
    /// Path and query as received, without the configured base path.
    pub path: &'a str,
    pub body: &'a Value,
    pub upstream_model: &'a str,
    pub stream: bool,
    /// `generateContent` / `streamGenerateContent` for native Gemini calls.
    pub gemini_action: Option<&'a str>,
}

/// Everything the relay needs to execute one request.
#[derive(Debug, Clone)]
pub struct RequestPlan {
    pub upstream: UpstreamRequest,
    pub pairing: Pairing,
}

/// Capability set every provider implements.
pub trait Adaptor {
    fn provider(&self) -> ProviderKind;

    /// Build the provider request and select the decoder/sink pairing.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotImplemented`] for inbound shapes the provider
    /// cannot serve and [`RelayError::InvalidRequest`] for unusable bodies.
    fn plan(&self, inbound: &InboundRequest<'_>) -> Result<RequestPlan, RelayError>;
}

/// Which chat requests a channel sends through the Responses API.
#[derive(Debug, Clone, Default)]
pub struct ChatViaResponses {
    enabled: bool,
    patterns: Vec<regex_lite::Regex>,
}

impl ChatViaResponses {
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] for a pattern that does not compile.
    pub fn new(enabled: bool, patterns: &[String]) -> Result<Self, RelayError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                regex_lite::Regex::new(pattern).map_err(|err| {
                    RelayError::Config(format!("invalid chat_via_responses pattern '{pattern}': {err}"))
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { enabled, patterns })
    }

    /// Enabled with no patterns matches every model.
    #[must_use]
    pub fn matches(&self, model: &str) -> bool {
        self.enabled
            && (self.patterns.is_empty() || self.patterns.iter().any(|re| re.is_match(model)))
    }
}

/// Plain OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct OpenAiAdaptor {
    base_url: String,
    api_key: String,
    chat_via_responses: ChatViaResponses,
}

impl OpenAiAdaptor {
    #[must_use]
    pub fn new(base_url: &str, api_key: &str, chat_via_responses: ChatViaResponses) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            chat_via_responses,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn headers(&self, stream: bool) -> Result<http::HeaderMap, RelayError> {
        let mut headers = http::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(if stream { EVENT_STREAM } else { APPLICATION_JSON }),
        );
        headers.insert(AUTHORIZATION, header_value(&bearer(&self.api_key))?);
        Ok(headers)
    }

    fn chat_plan(&self, inbound: &InboundRequest<'_>) -> Result<RequestPlan, RelayError> {
        if self.chat_via_responses.matches(inbound.upstream_model) {
            let mut body = chat_to_responses_request(inbound.body)?;
            set_field(&mut body, "model", Value::String(inbound.upstream_model.to_string()))?;
            let pairing = if inbound.stream {
                Pairing::ResponsesToChatStream
            } else {
                Pairing::ResponsesToChatDocument
            };
            return Ok(RequestPlan {
                upstream: UpstreamRequest {
                    url: self.url("/v1/responses"),
                    headers: self.headers(inbound.stream)?,
                    body: to_bytes(&body)?,
                },
                pairing,
            });
        }

        let mut body = with_model(inbound.body, inbound.upstream_model)?;
        if inbound.stream {
            let mut options = body
                .get("stream_options")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            options.insert("include_usage".into(), Value::Bool(true));
            set_field(&mut body, "stream_options", Value::Object(options))?;
        }
        Ok(RequestPlan {
            upstream: UpstreamRequest {
                url: self.url("/v1/chat/completions"),
                headers: self.headers(inbound.stream)?,
                body: to_bytes(&body)?,
            },
            pairing: passthrough_pairing(UpstreamWire::ChatCompletions, inbound.stream),
        })
    }

    fn responses_plan(&self, inbound: &InboundRequest<'_>) -> Result<RequestPlan, RelayError> {
        let body = with_model(inbound.body, inbound.upstream_model)?;
        Ok(RequestPlan {
            upstream: UpstreamRequest {
                url: self.url("/v1/responses"),
                headers: self.headers(inbound.stream)?,
                body: to_bytes(&body)?,
            },
            pairing: passthrough_pairing(UpstreamWire::Responses, inbound.stream),
        })
    }
}

impl Adaptor for OpenAiAdaptor {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn plan(&self, inbound: &InboundRequest<'_>) -> Result<RequestPlan, RelayError> {
        match inbound.ingress {
            IngressApi::OpenAiChat => self.chat_plan(inbound),
            IngressApi::OpenAiResponses => self.responses_plan(inbound),
            IngressApi::Anthropic | IngressApi::Gemini => Err(not_implemented("openai", inbound)),
        }
    }
}

/// Codex backend: always the Responses API, always streamed upstream.
#[derive(Debug, Clone)]
pub struct CodexAdaptor {
    base: OpenAiAdaptor,
}

const CODEX_USER_AGENT: &str = "codex_cli_rs/0.73.0 (Mac OS 15.3.0; arm64) Apple_Terminal/455";
const CODEX_ORIGINATOR: &str = "codex_cli_rs";

impl CodexAdaptor {
    #[must_use]
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base: OpenAiAdaptor::new(base_url, api_key, ChatViaResponses::default()),
        }
    }

    fn headers(&self, conversation_id: &str) -> Result<http::HeaderMap, RelayError> {
        let mut headers = http::HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CODEX_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        headers.insert(
            HeaderName::from_static("conversation_id"),
            header_value(conversation_id)?,
        );
        headers.insert(HeaderName::from_static("session_id"), header_value(conversation_id)?);
        headers.insert(AUTHORIZATION, header_value(&bearer(&self.base.api_key))?);
        headers.insert(
            HeaderName::from_static("originator"),
            HeaderValue::from_static(CODEX_ORIGINATOR),
        );
        Ok(headers)
    }
}

impl Adaptor for CodexAdaptor {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Codex
    }

    fn plan(&self, inbound: &InboundRequest<'_>) -> Result<RequestPlan, RelayError> {
        let (mut body, pairing) = match inbound.ingress {
            IngressApi::OpenAiResponses => (
                with_model(inbound.body, inbound.upstream_model)?,
                if inbound.stream {
                    Pairing::StreamPassthrough(UpstreamWire::Responses)
                } else {
                    Pairing::ResponsesToResponseDocument
                },
            ),
            IngressApi::OpenAiChat => {
                let mut body = chat_to_responses_request(inbound.body)?;
                set_field(&mut body, "model", Value::String(inbound.upstream_model.to_string()))?;
                (
                    body,
                    if inbound.stream {
                        Pairing::ResponsesToChatStream
                    } else {
                        Pairing::ResponsesToChatDocument
                    },
                )
            }
            IngressApi::Anthropic | IngressApi::Gemini => {
                return Err(not_implemented("codex", inbound));
            }
        };

        let conversation_id = uuid::Uuid::new_v4().to_string();
        set_field(&mut body, "prompt_cache_key", Value::String(conversation_id.clone()))?;
        set_field(&mut body, "stream", Value::Bool(true))?;
        if let Some(map) = body.as_object_mut() {
            map.remove("stream_options");
        }

        Ok(RequestPlan {
            upstream: UpstreamRequest {
                url: self.base.url("/v1/responses"),
                headers: self.headers(&conversation_id)?,
                body: to_bytes(&body)?,
            },
            pairing,
        })
    }
}

/// Anthropic messages through a Claude Code subscription.
#[derive(Debug, Clone)]
pub struct ClaudeCodeAdaptor {
    base_url: String,
    api_key: String,
}

const CLAUDE_CODE_HEADERS: &[(&str, &str)] = &[
    ("user-agent", "claude-cli/2.0.13 (external, cli)"),
    ("accept", APPLICATION_JSON),
    ("x-stainless-retry-count", "0"),
    ("x-stainless-timeout", "600"),
    ("x-stainless-lang", "js"),
    ("x-stainless-package-version", "0.60.0"),
    ("x-stainless-os", "MacOS"),
    ("x-stainless-arch", "arm64"),
    ("x-stainless-runtime", "node"),
    ("x-stainless-runtime-version", "v22.14.0"),
    ("anthropic-dangerous-direct-browser-access", "true"),
    ("anthropic-version", "2023-06-01"),
    ("x-app", "cli"),
    ("anthropic-beta", "fine-grained-tool-streaming-2025-05-14"),
    ("x-stainless-helper-method", "stream"),
    ("accept-language", "*"),
    ("sec-fetch-mode", "cors"),
    ("content-type", APPLICATION_JSON),
];

impl ClaudeCodeAdaptor {
    #[must_use]
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn headers(&self) -> Result<http::HeaderMap, RelayError> {
        let mut headers = http::HeaderMap::with_capacity(CLAUDE_CODE_HEADERS.len() + 1);
        for (name, value) in CLAUDE_CODE_HEADERS {
            headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
        headers.insert(AUTHORIZATION, header_value(&bearer(&self.api_key))?);
        Ok(headers)
    }
}

impl Adaptor for ClaudeCodeAdaptor {
    fn provider(&self) -> ProviderKind {
        ProviderKind::ClaudeCode
    }

    fn plan(&self, inbound: &InboundRequest<'_>) -> Result<RequestPlan, RelayError> {
        if inbound.ingress != IngressApi::Anthropic {
            return Err(not_implemented("claude-code", inbound));
        }
        let body = with_model(inbound.body, inbound.upstream_model)?;
        Ok(RequestPlan {
            upstream: UpstreamRequest {
                url: format!("{}{}", self.base_url, inbound.path),
                headers: self.headers()?,
                body: to_bytes(&body)?,
            },
            pairing: passthrough_pairing(UpstreamWire::AnthropicMessages, inbound.stream),
        })
    }
}

/// Native Gemini `generateContent` API.
#[derive(Debug, Clone)]
pub struct GeminiAdaptor {
    base_url: String,
    api_key: String,
}

impl GeminiAdaptor {
    #[must_use]
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

impl Adaptor for GeminiAdaptor {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn plan(&self, inbound: &InboundRequest<'_>) -> Result<RequestPlan, RelayError> {
        if inbound.ingress != IngressApi::Gemini {
            return Err(not_implemented("gemini", inbound));
        }
        let action = inbound.gemini_action.unwrap_or("generateContent");
        let url = match action {
            "generateContent" => format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, inbound.upstream_model
            ),
            "streamGenerateContent" => format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.base_url, inbound.upstream_model
            ),
            other => {
                return Err(RelayError::NotImplemented(format!(
                    "gemini action '{other}' is not supported"
                )));
            }
        };
        let mut headers = http::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        headers.insert(HeaderName::from_static("x-goog-api-key"), header_value(&self.api_key)?);
        Ok(RequestPlan {
            upstream: UpstreamRequest {
                url,
                headers,
                body: to_bytes(inbound.body)?,
            },
            pairing: passthrough_pairing(UpstreamWire::GeminiNative, inbound.stream),
        })
    }
}

/// Adaptor chosen by a channel's `provider` setting.
#[derive(Debug, Clone)]
pub enum ChannelAdaptor {
    OpenAi(OpenAiAdaptor),
    Codex(CodexAdaptor),
    ClaudeCode(ClaudeCodeAdaptor),
    Gemini(GeminiAdaptor),
}

impl ChannelAdaptor {
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] for an unknown provider or bad pattern.
    pub fn from_config(channel: &ChannelConfig) -> Result<Self, RelayError> {
        let kind = channel.provider_kind().ok_or_else(|| {
            RelayError::Config(format!(
                "channel '{}': unknown provider '{}'",
                channel.name, channel.provider
            ))
        })?;
        Ok(match kind {
            ProviderKind::OpenAi => Self::OpenAi(OpenAiAdaptor::new(
                &channel.base_url,
                &channel.api_key,
                ChatViaResponses::new(
                    channel.chat_via_responses,
                    &channel.chat_via_responses_models,
                )?,
            )),
            ProviderKind::Codex => Self::Codex(CodexAdaptor::new(&channel.base_url, &channel.api_key)),
            ProviderKind::ClaudeCode => {
                Self::ClaudeCode(ClaudeCodeAdaptor::new(&channel.base_url, &channel.api_key))
            }
            ProviderKind::Gemini => {
                Self::Gemini(GeminiAdaptor::new(&channel.base_url, &channel.api_key))
            }
        })
    }
}

impl Adaptor for ChannelAdaptor {
    fn provider(&self) -> ProviderKind {
        match self {
            Self::OpenAi(adaptor) => adaptor.provider(),
            Self::Codex(adaptor) => adaptor.provider(),
            Self::ClaudeCode(adaptor) => adaptor.provider(),
            Self::Gemini(adaptor) => adaptor.provider(),
        }
    }

    fn plan(&self, inbound: &InboundRequest<'_>) -> Result<RequestPlan, RelayError> {
        match self {
            Self::OpenAi(adaptor) => adaptor.plan(inbound),
            Self::Codex(adaptor) => adaptor.plan(inbound),
            Self::ClaudeCode(adaptor) => adaptor.plan(inbound),
            Self::Gemini(adaptor) => adaptor.plan(inbound),
        }
    }
}

fn passthrough_pairing(wire: UpstreamWire, stream: bool) -> Pairing {
    if stream {
        Pairing::StreamPassthrough(wire)
    } else {
        Pairing::DocumentPassthrough(wire)
    }
}

fn not_implemented(provider: &str, inbound: &InboundRequest<'_>) -> RelayError {
    RelayError::NotImplemented(format!(
        "{provider} channels do not serve {:?} requests",
        inbound.ingress
    ))
}

fn bearer(api_key: &str) -> String {
    if api_key.starts_with("Bearer ") {
        api_key.to_string()
    } else {
        format!("Bearer {api_key}")
    }
}

fn header_value(value: &str) -> Result<HeaderValue, RelayError> {
    HeaderValue::from_str(value)
        .map_err(|err| RelayError::Config(format!("invalid header value: {err}")))
}

fn with_model(body: &Value, model: &str) -> Result<Value, RelayError> {
    let mut body = body.clone();
    set_field(&mut body, "model", Value::String(model.to_string()))?;
    Ok(body)
}

fn set_field(body: &mut Value, key: &str, value: Value) -> Result<(), RelayError> {
    let map: &mut Map<String, Value> = body
        .as_object_mut()
        .ok_or_else(|| RelayError::InvalidRequest("request body must be a JSON object".into()))?;
    map.insert(key.to_string(), value);
    Ok(())
}

fn to_bytes(body: &Value) -> Result<Bytes, RelayError> {
    Ok(Bytes::from(serde_json::to_vec(body)?))
}
