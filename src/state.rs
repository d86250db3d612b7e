mod request_id;

use std::sync::Arc;

use crate::auth::{authenticate, build_allowed_key_set, AllowedClientKeys, ClientIdentity};
use crate::config::{AppConfig, ChannelConfig};
use crate::error::RelayError;
use crate::history::{ConversationSink, TracingConversationSink};
use crate::observability::metrics::RollingMetrics;
use crate::observability::token_counter::{HeuristicTokenizer, Tokenizer};
use crate::protocol::canonical::IngressApi;
use crate::relay::ChannelAdaptor;
use crate::routing::{ModelRouter, RouteTarget};
use crate::transport::HttpTransport;

use request_id::RequestIdMinter;
pub use request_id::RequestIds;

/// Collaborators built once at startup and shared by every request.
#[derive(Clone)]
pub struct SharedServices {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub metrics: Arc<RollingMetrics>,
    pub history: Option<Arc<dyn ConversationSink>>,
}

impl SharedServices {
    /// Default services: heuristic tokenizer, in-process metrics window and
    /// a log-backed history sink when history is enabled.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let history: Option<Arc<dyn ConversationSink>> = config
            .features
            .enable_history
            .then(|| Arc::new(TracingConversationSink) as Arc<dyn ConversationSink>);
        Self {
            tokenizer: Arc::new(HeuristicTokenizer),
            metrics: Arc::new(RollingMetrics::new()),
            history,
        }
    }
}

/// One routable channel: its settings and its adaptor.
pub struct Channel {
    pub config: ChannelConfig,
    pub adaptor: ChannelAdaptor,
}

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    pub model_router: ModelRouter,
    pub channels: Vec<Channel>,
    pub services: SharedServices,
    allowed_client_keys: AllowedClientKeys,
    request_ids: RequestIdMinter,
}

impl AppState {
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when a channel adaptor cannot be built.
    pub fn new(config: AppConfig, services: SharedServices) -> Result<Self, RelayError> {
        let channels = config
            .channels
            .iter()
            .map(|channel| {
                Ok(Channel {
                    adaptor: ChannelAdaptor::from_config(channel)?,
                    config: channel.clone(),
                })
            })
            .collect::<Result<Vec<_>, RelayError>>()?;
        Ok(Self {
            transport: HttpTransport::new(&config.server),
            model_router: ModelRouter::new(&config),
            allowed_client_keys: build_allowed_key_set(&config),
            request_ids: RequestIdMinter::new(),
            channels,
            services,
            config,
        })
    }

    /// Ids for a new request. Each call advances the routing sequence.
    pub fn mint_request_ids(&self) -> RequestIds {
        self.request_ids.mint()
    }

    /// Authenticate an ingress request using the prebuilt key index.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Auth` when the API key is missing or invalid.
    pub fn authenticate(
        &self,
        ingress: IngressApi,
        headers: &http::HeaderMap,
    ) -> Result<ClientIdentity, RelayError> {
        authenticate(ingress, headers, &self.allowed_client_keys)
    }

    /// Resolve a model to its channel.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidRequest` when no channel serves the model.
    pub fn route(&self, model: &str, request_seq: u64) -> Result<(RouteTarget<'_>, &Channel), RelayError> {
        let target = self.model_router.resolve(model, request_seq)?;
        let channel = self
            .channels
            .get(target.channel_index)
            .ok_or_else(|| RelayError::Config(format!("channel {} missing", target.channel_index)))?;
        Ok((target, channel))
    }
}
