pub mod validation;

use serde::{Deserialize, Serialize};

use crate::protocol::canonical::ProviderKind;
use crate::stream::ScannerLimits;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Listener, runtime and upstream client settings.
///
/// Omitted runtime fields take their defaults; an explicit `null` leaves the
/// choice to tokio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Upstream request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(
        default = "default_runtime_max_blocking_threads",
        skip_serializing_if = "Option::is_none"
    )]
    pub runtime_max_blocking_threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_thread_stack_size_kb: Option<usize>,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub http_use_env_proxy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_reuse_port_listener_count: Option<usize>,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    600
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}
#[allow(clippy::unnecessary_wraps)]
fn default_runtime_max_blocking_threads() -> Option<usize> {
    Some(8)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            runtime_worker_threads: None,
            runtime_max_blocking_threads: default_runtime_max_blocking_threads(),
            runtime_thread_stack_size_kb: None,
            base_path: String::new(),
            http_use_env_proxy: false,
            tcp_reuse_port_listener_count: None,
        }
    }
}

/// Upstream body reading and downstream pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_scanner_initial_buffer_bytes")]
    pub scanner_initial_buffer_bytes: usize,
    #[serde(default = "default_scanner_max_buffer_mb")]
    pub scanner_max_buffer_mb: usize,
    #[serde(default = "default_downstream_channel_capacity")]
    pub downstream_channel_capacity: usize,
}

fn default_scanner_initial_buffer_bytes() -> usize {
    64 * 1024
}
fn default_scanner_max_buffer_mb() -> usize {
    64
}
fn default_downstream_channel_capacity() -> usize {
    32
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            scanner_initial_buffer_bytes: default_scanner_initial_buffer_bytes(),
            scanner_max_buffer_mb: default_scanner_max_buffer_mb(),
            downstream_channel_capacity: default_downstream_channel_capacity(),
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub fn scanner_limits(&self) -> ScannerLimits {
        ScannerLimits {
            initial_capacity: self.scanner_initial_buffer_bytes,
            max_line_bytes: self.scanner_max_buffer_mb.saturating_mul(1024 * 1024),
        }
    }
}

/// One upstream channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    /// Served models; `alias:real` maps a client-facing name to an upstream one.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub chat_via_responses: bool,
    /// Regex patterns selecting models whose chat requests go via responses.
    #[serde(default)]
    pub chat_via_responses_models: Vec<String>,
    #[serde(default)]
    pub thinking_to_content: bool,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_provider() -> String {
    "openai".to_string()
}

impl ChannelConfig {
    #[must_use]
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        ProviderKind::from_config_name(&self.provider)
    }
}

/// A client key, optionally mapped to the ids billing is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientKeyConfig {
    Plain(String),
    Mapped {
        key: String,
        #[serde(default)]
        user_id: u64,
        #[serde(default)]
        token_id: u64,
    },
}

impl ClientKeyConfig {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Plain(key) | Self::Mapped { key, .. } => key,
        }
    }

    /// `(user_id, token_id)`; plain keys map to zero ids.
    #[must_use]
    pub fn ids(&self) -> (u64, u64) {
        match self {
            Self::Plain(_) => (0, 0),
            Self::Mapped {
                user_id, token_id, ..
            } => (*user_id, *token_id),
        }
    }
}

/// Client authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    pub allowed_keys: Vec<ClientKeyConfig>,
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub enable_history: bool,
    #[serde(default = "default_metrics_cleanup_interval_secs")]
    pub metrics_cleanup_interval_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_metrics_cleanup_interval_secs() -> u64 {
    60
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_history: true,
            metrics_cleanup_interval_secs: default_metrics_cleanup_interval_secs(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    pub channels: Vec<ChannelConfig>,
    pub client_authentication: ClientAuthConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] or [`ConfigError::Validation`].
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}
