use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since_the_epoch| since_the_epoch.as_millis() as u64)
}

/// Shortens `base` by a random share of at most `ratio`, so concurrent
/// fetches don't all finish on the same tick.
pub fn jittered(base: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 {
        return base;
    }
    base.mul_f64(1.0 - rand::random::<f64>() * ratio.min(1.0))
}
