//! Rate limiter contract consulted by workers before each dispatch.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// An event budget: at most `events` dispatches per `per` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub events: u32,
    pub per: Duration,
}

impl RateLimit {
    pub fn per_second(events: u32) -> Self {
        Self {
            events,
            per: Duration::from_secs(1),
        }
    }

    pub fn per_minute(events: u32) -> Self {
        Self {
            events,
            per: Duration::from_secs(60),
        }
    }
}

/// Decides whether one more dispatch is allowed for the named queue.
///
/// Workers call this in a sleep-retry loop: when not allowed, they sleep
/// the returned duration and ask again. Implementations backed by a
/// shared store (e.g. Redis) give a fleet-wide limit; [`LocalRateLimiter`]
/// limits a single process.
pub trait RateLimiter: Send + Sync {
    fn allow_rate(&self, name: &str, limit: RateLimit) -> (Duration, bool);
}

/// Fixed-window limiter for single-process deployments.
#[derive(Default)]
pub struct LocalRateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

struct Window {
    started_at: Instant,
    count: u32,
}

impl LocalRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimiter for LocalRateLimiter {
    fn allow_rate(&self, name: &str, limit: RateLimit) -> (Duration, bool) {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        let window = windows.entry(name.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(window.started_at) >= limit.per {
            window.started_at = now;
            window.count = 0;
        }

        if window.count < limit.events {
            window.count += 1;
            (Duration::ZERO, true)
        } else {
            let elapsed = now.duration_since(window.started_at);
            (limit.per.saturating_sub(elapsed), false)
        }
    }
}
