//! A per-key "emit at most once per window" guard — nothing fancier than a
//! small `HashMap` keyed by identity, checked and updated inline. Used for
//! the `BACKPRESSURE_DROP` and `OVERLOAD` "at most once per device per
//! minute" rules (§4.1, §5).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub struct RateLimiter<K> {
    window: Duration,
    last_emitted: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` the first time a key fires and again only after
    /// `window` has elapsed since the last time it fired.
    pub async fn should_emit(&self, key: K) -> bool {
        let mut map = self.last_emitted.lock().await;
        let now = Instant::now();
        match map.get(&key) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                map.insert(key, now);
                true
            }
        }
    }
}

impl<K: Eq + Hash + Clone> Default for RateLimiter<K> {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
