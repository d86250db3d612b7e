pub mod dispatch;

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::config::AppConfig;
use crate::error::RelayError;

/// The channel and upstream model chosen for a request.
#[derive(Debug, Clone, Copy)]
pub struct RouteTarget<'a> {
    pub channel_index: usize,
    pub upstream_model: &'a str,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    channel_index: usize,
    model_id: usize,
}

/// Index of every configured model name and alias to the channels serving it.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    model_index: FxHashMap<String, Vec<Candidate>>,
    /// Interned upstream model names used by candidates.
    interned_models: Vec<Arc<str>>,
}

impl ModelRouter {
    /// Build the router from the configured channels.
    ///
    /// A model entry is either `name` or `alias:upstream_model`.
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        let mut model_index: FxHashMap<String, Vec<Candidate>> = FxHashMap::default();
        let mut interned_models: Vec<Arc<str>> = Vec::new();
        let mut interned_index: FxHashMap<String, usize> = FxHashMap::default();

        for (channel_index, channel) in config.channels.iter().enumerate() {
            for entry in &channel.models {
                let (requested, upstream) = entry
                    .split_once(':')
                    .unwrap_or((entry.as_str(), entry.as_str()));
                let model_id = intern_model_id(upstream, &mut interned_index, &mut interned_models);
                model_index
                    .entry(requested.to_string())
                    .or_default()
                    .push(Candidate {
                        channel_index,
                        model_id,
                    });
            }
        }

        Self {
            model_index,
            interned_models,
        }
    }

    /// Requested model names clients may use, sorted.
    #[must_use]
    pub fn model_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.model_index.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a requested model. Models served by several channels rotate
    /// through them by request sequence.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidRequest` when no channel serves the model.
    pub fn resolve(&self, model: &str, request_seq: u64) -> Result<RouteTarget<'_>, RelayError> {
        let candidates = self
            .model_index
            .get(model)
            .filter(|candidates| !candidates.is_empty())
            .ok_or_else(|| {
                RelayError::InvalidRequest(format!("No channel found for model '{model}'"))
            })?;
        let slot = usize::try_from(request_seq % candidates.len() as u64).unwrap_or(0);
        let candidate = candidates[slot];
        let upstream_model = self
            .interned_models
            .get(candidate.model_id)
            .ok_or_else(|| RelayError::Config("model router index out of range".to_string()))?;
        Ok(RouteTarget {
            channel_index: candidate.channel_index,
            upstream_model,
        })
    }
}

fn intern_model_id(
    model: &str,
    interned_index: &mut FxHashMap<String, usize>,
    interned_models: &mut Vec<Arc<str>>,
) -> usize {
    if let Some(id) = interned_index.get(model) {
        return *id;
    }
    let id = interned_models.len();
    interned_models.push(Arc::from(model));
    interned_index.insert(model.to_string(), id);
    id
}
