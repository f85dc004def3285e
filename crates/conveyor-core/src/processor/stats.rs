//! Lock-free processor counters.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::observability::ProcessorStats;

/// Hot-path counters, updated with fetch-and-add only.
///
/// Decrements use `fetch_sub`, which wraps in two's complement; in a
/// correct execution every decrement pairs with an earlier increment, so
/// the observable value never goes negative.
#[derive(Default)]
pub(crate) struct Counters {
    in_flight: AtomicU32,
    deleting: AtomicU32,
    processed: AtomicU32,
    retries: AtomicU32,
    fails: AtomicU32,
    avg_duration_ms: AtomicU32,
}

impl Counters {
    pub fn incr_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn incr_deleting(&self) {
        self.deleting.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_deleting(&self, n: u32) {
        self.deleting.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn incr_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_fails(&self) {
        self.fails.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one handler duration into the moving average (EWMA, α = 0.01).
    /// Compare-exchange retry keeps the update lock-free under contention.
    pub fn observe_duration(&self, duration: Duration) {
        const DECAY: f64 = 0.01;
        let sample_ms = duration.as_millis() as f64;
        loop {
            let avg = self.avg_duration_ms.load(Ordering::Relaxed);
            let new_avg = ((1.0 - DECAY) * f64::from(avg) + DECAY * sample_ms) as u32;
            if self
                .avg_duration_ms
                .compare_exchange_weak(avg, new_avg, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            deleting: self.deleting.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
            avg_duration: Duration::from_millis(u64::from(
                self.avg_duration_ms.load(Ordering::Relaxed),
            )),
        }
    }
}
