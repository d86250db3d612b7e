use std::sync::Arc;

use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status, config summary and per-channel rates.
pub fn health_handler(state: &Arc<AppState>) -> Json<Value> {
    let config = &state.config;
    let channels: Vec<Value> = state
        .channels
        .iter()
        .map(|channel| {
            let rates = state.services.metrics.rates(&channel.config.name);
            json!({
                "name": channel.config.name,
                "provider": channel.config.provider,
                "rpm": rates.rpm,
                "tpm": rates.tpm,
            })
        })
        .collect();
    Json(json!({
        "status": "relaybridge is running",
        "config": {
            "channels_count": config.channels.len(),
            "client_keys_count": config.client_authentication.allowed_keys.len(),
            "models": state.model_router.model_names(),
            "features": {
                "log_level": config.features.log_level,
                "enable_history": config.features.enable_history,
            }
        },
        "channels": channels,
    }))
}
