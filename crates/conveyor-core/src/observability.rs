use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Point-in-time processor statistics.
///
/// Fields are read with independent atomic loads, so the snapshot is
/// per-field consistent but not consistent across fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub in_flight: u32,
    pub deleting: u32,
    pub processed: u32,
    pub retries: u32,
    pub fails: u32,
    pub avg_duration: Duration,
}
