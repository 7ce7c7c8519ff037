//! Fire-time computation

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Uniform random delay in `[0, splay]`, millisecond resolution
pub fn jitter(splay: Duration) -> Duration {
    let max = u64::try_from(splay.as_millis()).unwrap_or(u64::MAX);
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

/// Next fire after `last_fire`; the splay is redrawn on every call
pub fn next_fire(last_fire: Instant, interval: Duration, splay: Duration) -> Instant {
    last_fire + interval + jitter(splay)
}
