//! Identifiers minted once per relayed request.
use std::sync::atomic::{AtomicU64, Ordering};

use crate::util::format_request_seq_hex;

/// Ids shared by routing, the client-visible body and history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIds {
    /// Per-process sequence; drives round-robin channel choice.
    pub seq: u64,
    /// Correlates logs with history records.
    pub request_id: String,
    /// Id of synthesized chat completions and their chunks.
    pub completion_id: String,
}

/// Mints [`RequestIds`]. Completion ids are offset by a random epoch so they
/// do not repeat across restarts.
pub(crate) struct RequestIdMinter {
    epoch: u64,
    counter: AtomicU64,
}

impl RequestIdMinter {
    pub(crate) fn new() -> Self {
        Self::with_epoch(fastrand::u64(..))
    }

    fn with_epoch(epoch: u64) -> Self {
        Self {
            epoch,
            counter: AtomicU64::new(0),
        }
    }

    pub(crate) fn mint(&self) -> RequestIds {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        RequestIds {
            seq,
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            completion_id: format_request_seq_hex("chatcmpl-", self.epoch.wrapping_add(seq)),
        }
    }
}
