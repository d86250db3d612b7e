pub mod metrics;
pub mod token_counter;

use crate::protocol::canonical::Usage;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Config levels map as
/// `DISABLED` (no subscriber), `WARNING` (WARN) and `CRITICAL` (ERROR); other
/// values are used as filter directives. `LOG_FORMAT=json` switches to one
/// JSON object per line.
pub fn init_tracing(log_level: &str) {
    let level = log_level.to_uppercase();
    if level == "DISABLED" {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(config_directive(&level)).unwrap_or_else(|_| EnvFilter::new("INFO"))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let installed = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn config_directive(level: &str) -> &str {
    match level {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    }
}

/// Log token usage for a completed request, computing duration from start time.
pub fn log_request_complete(
    model: &str,
    channel: &str,
    usage: &Usage,
    start_time: std::time::Instant,
) {
    token_counter::log_request_usage(model, channel, usage, start_time.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_level_aliases() {
        assert_eq!(config_directive("WARNING"), "WARN");
        assert_eq!(config_directive("CRITICAL"), "ERROR");
        assert_eq!(config_directive("DEBUG"), "DEBUG");
    }
}
