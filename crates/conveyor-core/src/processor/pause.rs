//! Adaptive fetcher pausing under sustained failure.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const PAUSE_THRESHOLD: u32 = 100;
const ERROR_PAUSE: Duration = Duration::from_secs(60);

/// Threshold above which an explicit handler delay is treated as a
/// backend-wide signal and fed into the pause policy.
pub(crate) const LONG_DELAY: Duration = Duration::from_secs(60);

/// Tracks failure signals and tells the fetcher when to stop pulling.
///
/// Two independent signals:
/// - `err_count`: one per handler failure; past the threshold the fetcher
///   pauses for a fixed minute.
/// - `delay_count`/`delay_sec`: handlers returning explicit delays over a
///   minute ("the upstream is down, come back later"); past the threshold
///   the fetcher pauses for the advertised delay itself.
///
/// `reset` runs before every pause and on every successful delete, so one
/// healthy message ends the pause regime.
#[derive(Default)]
pub(crate) struct PauseController {
    err_count: AtomicU32,
    delay_count: AtomicU32,
    delay_sec: AtomicU32,
}

impl PauseController {
    pub fn note_error(&self) {
        self.err_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_long_delay(&self, delay: Duration) {
        self.delay_sec
            .store(delay.as_secs() as u32, Ordering::Relaxed);
        self.delay_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pause_duration(&self) -> Duration {
        if self.delay_count.load(Ordering::Relaxed) > PAUSE_THRESHOLD {
            return Duration::from_secs(u64::from(self.delay_sec.load(Ordering::Relaxed)));
        }
        if self.err_count.load(Ordering::Relaxed) > PAUSE_THRESHOLD {
            return ERROR_PAUSE;
        }
        Duration::ZERO
    }

    pub fn reset(&self) {
        self.err_count.store(0, Ordering::Relaxed);
        self.delay_count.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn delay_count(&self) -> u32 {
        self.delay_count.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn delay_sec(&self) -> u32 {
        self.delay_sec.load(Ordering::Relaxed)
    }
}
