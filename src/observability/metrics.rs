use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

const ROLLING_WINDOW: Duration = Duration::from_secs(60);
const ROLLING_BUCKET: Duration = Duration::from_secs(5);
const ROLLING_BUCKET_NUM: usize = 12;
const MAX_DETAIL_CHARS: usize = 80;

static REQUEST_ID_PATTERN: LazyLock<Option<regex_lite::Regex>> =
    LazyLock::new(|| regex_lite::Regex::new(r"\(request id:[^)]+\)").ok());

/// Result of one upstream call, as seen by metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error { status: u16, kind: String, detail: String },
}

/// Receives one observation per finished upstream call.
pub trait MetricsRecorder: Send + Sync {
    fn observe(&self, channel: &str, duration: Duration, tokens: u64, outcome: &Outcome);
}

/// Requests and tokens over the trailing one-minute window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelRates {
    pub rpm: u64,
    pub tpm: u64,
}

/// Lifetime counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelTotals {
    pub success: u64,
    pub errors: u64,
    pub tokens: u64,
    pub latency_seconds: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    slot: Option<u64>,
    requests: u64,
    tokens: u64,
}

#[derive(Debug, Default)]
struct RollingSeries {
    buckets: [Bucket; ROLLING_BUCKET_NUM],
    totals: ChannelTotals,
}

impl RollingSeries {
    fn add(&mut self, slot: u64, requests: u64, tokens: u64) {
        let target = self
            .buckets
            .iter()
            .position(|bucket| bucket.slot == Some(slot))
            .unwrap_or_else(|| {
                let oldest = self
                    .buckets
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, bucket)| bucket.slot.map_or(0, |s| s + 1))
                    .map_or(0, |(idx, _)| idx);
                self.buckets[oldest] = Bucket {
                    slot: Some(slot),
                    requests: 0,
                    tokens: 0,
                };
                oldest
            });
        self.buckets[target].requests += requests;
        self.buckets[target].tokens += tokens;
    }

    /// Sums buckets inside the window and returns the newest active slot.
    fn rates(&self, now_slot: u64) -> (ChannelRates, Option<u64>) {
        let cutoff = now_slot.saturating_sub(ROLLING_BUCKET_NUM as u64 - 1);
        let mut rates = ChannelRates::default();
        let mut last_active = None;
        for bucket in &self.buckets {
            let Some(slot) = bucket.slot else { continue };
            if slot >= cutoff && slot <= now_slot {
                rates.rpm += bucket.requests;
                rates.tpm += bucket.tokens;
                last_active = last_active.max(Some(slot));
            }
        }
        (rates, last_active)
    }
}

/// In-process per-channel rolling window (one minute, five-second buckets).
#[derive(Debug)]
pub struct RollingMetrics {
    origin: Instant,
    series: Mutex<FxHashMap<String, RollingSeries>>,
}

impl Default for RollingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            series: Mutex::new(FxHashMap::default()),
        }
    }

    fn slot_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        elapsed.as_secs() / ROLLING_BUCKET.as_secs()
    }

    pub fn observe_at(
        &self,
        now: Instant,
        channel: &str,
        duration: Duration,
        tokens: u64,
        outcome: &Outcome,
    ) {
        let label = normalize_channel_label(channel);
        let slot = self.slot_at(now);
        let mut series = self.series.lock();
        let entry = series.entry(label.to_string()).or_default();
        entry.add(slot, 1, tokens);
        entry.totals.tokens += tokens;
        entry.totals.latency_seconds += duration.as_secs_f64();
        match outcome {
            Outcome::Success => entry.totals.success += 1,
            Outcome::Error { status, kind, detail } => {
                entry.totals.errors += 1;
                debug!(
                    channel = label,
                    status = status,
                    error_type = kind.as_str(),
                    detail = sanitize_error_detail(detail),
                    "channel error recorded"
                );
            }
        }
    }

    #[must_use]
    pub fn rates_at(&self, now: Instant, channel: &str) -> ChannelRates {
        let slot = self.slot_at(now);
        self.series
            .lock()
            .get(normalize_channel_label(channel))
            .map(|series| series.rates(slot).0)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn rates(&self, channel: &str) -> ChannelRates {
        self.rates_at(Instant::now(), channel)
    }

    #[must_use]
    pub fn totals(&self, channel: &str) -> Option<ChannelTotals> {
        self.series
            .lock()
            .get(normalize_channel_label(channel))
            .map(|series| series.totals)
    }

    /// Drop channels with no activity inside the window.
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let slot = self.slot_at(now);
        let mut series = self.series.lock();
        let before = series.len();
        series.retain(|_, entry| entry.rates(slot).1.is_some());
        before - series.len()
    }

    /// Periodically evict idle channels until the runtime shuts down.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = metrics.evict_idle_at(Instant::now());
                if evicted > 0 {
                    debug!(evicted, "evicted idle channel metrics");
                }
            }
        })
    }
}

impl MetricsRecorder for RollingMetrics {
    fn observe(&self, channel: &str, duration: Duration, tokens: u64, outcome: &Outcome) {
        self.observe_at(Instant::now(), channel, duration, tokens, outcome);
    }
}

fn normalize_channel_label(channel: &str) -> &str {
    if channel.is_empty() {
        "unknown"
    } else {
        channel
    }
}

/// Strip request ids and cap length so error details stay low-cardinality.
#[must_use]
pub fn sanitize_error_detail(detail: &str) -> String {
    let stripped = match REQUEST_ID_PATTERN.as_ref() {
        Some(pattern) => pattern.replace_all(detail, "").into_owned(),
        None => detail.to_string(),
    };
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    if trimmed.chars().count() > MAX_DETAIL_CHARS {
        let mut out: String = trimmed.chars().take(MAX_DETAIL_CHARS).collect();
        out.push('…');
        return out;
    }
    trimmed.to_string()
}
