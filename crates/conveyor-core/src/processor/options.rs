//! Processing options, immutable once the processor is built.

use std::sync::Arc;
use std::time::Duration;

use crate::handler::Handler;
use crate::rate_limit::{RateLimit, RateLimiter};

/// Tuning knobs for a [`Processor`](super::Processor).
///
/// Zero/unset fields are filled with defaults by [`Options::init`], which
/// the processor constructor calls; after that the options never change.
#[derive(Clone, Default)]
pub struct Options {
    /// Workers dispatching messages to the handler.
    pub worker_number: usize,

    /// Concurrent batch-delete flushes.
    pub scavenger_number: usize,

    /// Capacity of the internal buffer; also the reserve batch size.
    pub buffer_size: usize,

    /// A message whose handler keeps failing is retried while its
    /// reservation count stays below this limit, then deleted.
    pub retry_limit: u32,

    /// Base delay for the exponential retry backoff.
    pub min_backoff: Duration,

    /// Dispatch budget consulted before every handler invocation.
    pub rate_limit: Option<RateLimit>,

    /// Where rate-limit decisions are made; pair with `rate_limit`.
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,

    /// Invoked when a message exhausts its retry budget, before deletion.
    pub fallback_handler: Option<Arc<dyn Handler>>,
}

impl Options {
    /// Fill unset fields with defaults.
    pub fn init(&mut self) {
        if self.worker_number == 0 {
            self.worker_number = 10;
        }
        if self.scavenger_number == 0 {
            self.scavenger_number = 2;
        }
        if self.buffer_size == 0 {
            self.buffer_size = 10;
        }
        if self.retry_limit == 0 {
            self.retry_limit = 10;
        }
        if self.min_backoff.is_zero() {
            self.min_backoff = Duration::from_secs(30);
        }
    }
}
