use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

fn shorten(value: &str, head: usize, tail: usize) -> String {
    if value.len() <= head + tail {
        return value.to_string();
    }
    format!("{}..{}", &value[..head], &value[value.len() - tail..])
}

/// Chunk hashes are long and repetitive; log lines carry a short form.
pub fn redact_hex(value: &str) -> String {
    shorten(value, 8, 8)
}

/// Rate-limits noisy warnings by key. Returns true when the caller should
/// emit the warning this time.
pub fn warn_throttled(key: &'static str, interval: Duration) -> bool {
    static LAST_WARN: OnceLock<Mutex<HashMap<&'static str, Instant>>> = OnceLock::new();
    let map = LAST_WARN.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let now = Instant::now();
    match guard.get_mut(key) {
        Some(last) => {
            if now.saturating_duration_since(*last) < interval {
                false
            } else {
                *last = now;
                true
            }
        }
        None => {
            guard.insert(key, now);
            true
        }
    }
}
