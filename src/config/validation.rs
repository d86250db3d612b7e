use std::collections::HashSet;

use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_stream_config(config)?;
    validate_allowed_keys(config)?;
    validate_channels(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    let optional_counts = [
        ("runtime_worker_threads", server.runtime_worker_threads),
        (
            "runtime_max_blocking_threads",
            server.runtime_max_blocking_threads,
        ),
        (
            "runtime_thread_stack_size_kb",
            server.runtime_thread_stack_size_kb,
        ),
        (
            "tcp_reuse_port_listener_count",
            server.tcp_reuse_port_listener_count,
        ),
    ];
    for (field, value) in optional_counts {
        if value == Some(0) {
            return Err(validation_err(format!(
                "server.{field} must be greater than 0 when set"
            )));
        }
    }
    Ok(())
}

fn validate_stream_config(config: &AppConfig) -> Result<(), ConfigError> {
    let stream = &config.stream;
    if stream.scanner_initial_buffer_bytes == 0 {
        return Err(validation_err(
            "stream.scanner_initial_buffer_bytes must be greater than 0",
        ));
    }
    if stream.scanner_max_buffer_mb == 0 {
        return Err(validation_err(
            "stream.scanner_max_buffer_mb must be greater than 0",
        ));
    }
    if stream.scanner_initial_buffer_bytes > stream.scanner_max_buffer_mb.saturating_mul(1024 * 1024)
    {
        return Err(validation_err(
            "stream.scanner_initial_buffer_bytes cannot exceed stream.scanner_max_buffer_mb",
        ));
    }
    if stream.downstream_channel_capacity == 0 {
        return Err(validation_err(
            "stream.downstream_channel_capacity must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_allowed_keys(config: &AppConfig) -> Result<(), ConfigError> {
    if config.client_authentication.allowed_keys.is_empty() {
        return Err(validation_err("allowed_keys cannot be empty"));
    }
    let mut seen = HashSet::new();
    for entry in &config.client_authentication.allowed_keys {
        let key = entry.key();
        if key.trim().is_empty() {
            return Err(validation_err("allowed_keys contains an empty key"));
        }
        if !seen.insert(key) {
            return Err(validation_err("allowed_keys contains a duplicate key"));
        }
    }
    Ok(())
}

const VALID_PROVIDERS: &[&str] = &["openai", "codex", "claude-code", "gemini"];

fn validate_channels(config: &AppConfig) -> Result<(), ConfigError> {
    if config.channels.is_empty() {
        return Err(validation_err("channels cannot be empty"));
    }

    let mut names = HashSet::new();
    for channel in &config.channels {
        if channel.name.trim().is_empty() {
            return Err(validation_err("channel name cannot be empty"));
        }
        if !names.insert(channel.name.as_str()) {
            return Err(validation_err(format!(
                "duplicate channel name '{}'",
                channel.name
            )));
        }
        if !channel.base_url.starts_with("http://") && !channel.base_url.starts_with("https://") {
            return Err(validation_err(format!(
                "Channel '{}': base_url must start with http:// or https://",
                channel.name
            )));
        }
        if channel.api_key.trim().is_empty() {
            return Err(validation_err(format!(
                "Channel '{}': api_key cannot be empty",
                channel.name
            )));
        }
        if !VALID_PROVIDERS.contains(&channel.provider.as_str()) {
            return Err(validation_err(format!(
                "Channel '{}': unknown provider '{}'. Must be one of: {}",
                channel.name,
                channel.provider,
                VALID_PROVIDERS.join(", ")
            )));
        }
        if channel.models.is_empty() {
            return Err(validation_err(format!(
                "Channel '{}' must have at least one model",
                channel.name
            )));
        }
        for pattern in &channel.chat_via_responses_models {
            regex_lite::Regex::new(pattern).map_err(|err| {
                validation_err(format!(
                    "Channel '{}': invalid chat_via_responses_models pattern '{pattern}': {err}",
                    channel.name
                ))
            })?;
        }
        validate_proxy_url(&channel.name, channel.proxy.as_deref())?;
    }

    // The same model may be served by several channels; duplicates inside one
    // channel are rejected.
    let mut regular_models = HashSet::new();
    let mut all_aliases = HashSet::new();

    for channel in &config.channels {
        let mut channel_entries = HashSet::new();
        for model in &channel.models {
            if model.trim().is_empty() {
                return Err(validation_err(format!(
                    "Channel '{}': model name cannot be empty",
                    channel.name
                )));
            }
            if !channel_entries.insert(model.as_str()) {
                return Err(validation_err(format!(
                    "Channel '{}': duplicate model entry '{model}'",
                    channel.name
                )));
            }
            if let Some((alias, real_model)) = model.split_once(':') {
                if alias.trim().is_empty() || real_model.trim().is_empty() {
                    return Err(validation_err(format!(
                        "Invalid alias format in '{model}'. Both parts must not be empty."
                    )));
                }
                all_aliases.insert(alias);
            } else {
                regular_models.insert(model.as_str());
            }
        }
    }

    for alias in &all_aliases {
        if regular_models.contains(alias) {
            return Err(validation_err(format!(
                "Alias name '{alias}' conflicts with a regular model name"
            )));
        }
    }

    Ok(())
}

fn validate_proxy_url(channel_name: &str, proxy: Option<&str>) -> Result<(), ConfigError> {
    let Some(proxy) = proxy.map(str::trim) else {
        return Ok(());
    };
    if proxy.is_empty() {
        return Err(validation_err(format!(
            "Channel '{channel_name}': proxy cannot be empty when set"
        )));
    }
    let parsed = url::Url::parse(proxy).map_err(|err| {
        validation_err(format!(
            "Channel '{channel_name}': proxy is not a valid URL: {err}"
        ))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "Channel '{channel_name}': proxy must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;

    fn make_valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            stream: StreamConfig::default(),
            channels: vec![ChannelConfig {
                name: "openai".to_string(),
                provider: "openai".to_string(),
                base_url: "https://api.openai.com".to_string(),
                api_key: "sk-test".to_string(),
                models: vec!["gpt-4o".to_string()],
                chat_via_responses: false,
                chat_via_responses_models: Vec::new(),
                thinking_to_content: false,
                proxy: None,
            }],
            client_authentication: ClientAuthConfig {
                allowed_keys: vec![ClientKeyConfig::Plain("sk-client-key".to_string())],
            },
            features: FeaturesConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = make_valid_config();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_empty_allowed_keys() {
        let mut config = make_valid_config();
        config.client_authentication.allowed_keys = vec![];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_allowed_keys() {
        let mut config = make_valid_config();
        config
            .client_authentication
            .allowed_keys
            .push(ClientKeyConfig::Mapped {
                key: "sk-client-key".to_string(),
                user_id: 1,
                token_id: 2,
            });
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_same_model_across_channels() {
        let mut config = make_valid_config();
        let mut second = config.channels[0].clone();
        second.name = "second".to_string();
        config.channels.push(second);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_channel_name() {
        let mut config = make_valid_config();
        let second = config.channels[0].clone();
        config.channels.push(second);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_model_within_same_channel() {
        let mut config = make_valid_config();
        config.channels[0].models.push("gpt-4o".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_alias_conflicts_with_model() {
        let mut config = make_valid_config();
        config.channels[0]
            .models
            .push("gpt-4o:gpt-4o-2024-08-06".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_unknown_provider() {
        let mut config = make_valid_config();
        config.channels[0].provider = "openai-responses".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_chat_via_responses_pattern() {
        let mut config = make_valid_config();
        config.channels[0].chat_via_responses_models = vec!["gpt-5(".to_string()];
        assert!(validate_config(&config).is_err());
        config.channels[0].chat_via_responses_models = vec!["^gpt-5.*".to_string()];
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = make_valid_config();
        config.channels[0].base_url = "ftp://bad.url".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_api_key() {
        let mut config = make_valid_config();
        config.channels[0].api_key = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_proxy() {
        let mut config = make_valid_config();
        config.channels[0].proxy = Some("ftp://proxy".to_string());
        assert!(validate_config(&config).is_err());
        config.channels[0].proxy = Some("http://127.0.0.1:7890".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = make_valid_config();
        config.features.log_level = "VERBOSE".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_stream_limits() {
        let mut config = make_valid_config();
        config.stream.downstream_channel_capacity = 0;
        assert!(validate_config(&config).is_err());

        let mut config = make_valid_config();
        config.stream.scanner_max_buffer_mb = 1;
        config.stream.scanner_initial_buffer_bytes = 2 * 1024 * 1024;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_runtime_worker_threads() {
        let mut config = make_valid_config();
        config.server.runtime_worker_threads = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_tcp_reuse_port_listener_count() {
        let mut config = make_valid_config();
        config.server.tcp_reuse_port_listener_count = Some(0);
        assert!(validate_config(&config).is_err());
    }
}
