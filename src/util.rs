use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

pub(crate) fn unix_now_secs() -> u64 {
    since_epoch().as_secs()
}

pub(crate) fn unix_now_millis() -> u128 {
    since_epoch().as_millis()
}

/// `prefix` followed by a fresh v4 uuid in simple (unhyphenated) form.
pub(crate) fn prefixed_uuid(prefix: &str) -> String {
    format!("{prefix}{}", uuid::Uuid::new_v4().simple())
}

/// `prefix` followed by the request sequence as 16 lowercase hex digits.
pub(crate) fn format_request_seq_hex(prefix: &str, request_seq: u64) -> String {
    format!("{prefix}{request_seq:016x}")
}
