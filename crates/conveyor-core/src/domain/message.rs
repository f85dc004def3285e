//! Message envelope: the unit of work moving through a queue.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of a message.
///
/// ULID-backed: sortable by creation time and generated without
/// coordination, which matters when producers live in many processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Ulid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// A message reserved from (or destined for) a backing queue.
///
/// The processor treats the payload as opaque: `name` selects the handler
/// logic, `args` is whatever JSON the producer attached. The remaining
/// fields belong to the delivery machinery:
/// - `delay`: when set, the processor does not invoke the handler but
///   releases the message so it becomes visible again after the delay
///   (scheduling future work).
/// - `reserved_count`: bumped by the backend on every reservation; drives
///   the retry/fail decision and the backoff exponent.
/// - `receipt`: backend-specific token needed to release or delete the
///   reservation (e.g. an SQS receipt handle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    name: String,
    args: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    delay: Option<Duration>,

    #[serde(default)]
    reserved_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    receipt: Option<String>,
}

impl Message {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: MessageId::generate(),
            name: name.into(),
            args,
            delay: None,
            reserved_count: 0,
            receipt: None,
        }
    }

    /// Schedule this message to run after `delay` instead of immediately.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &serde_json::Value {
        &self.args
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    /// Clear and return the scheduling delay. Backends call this when the
    /// delay has been honored and the message is being made deliverable.
    pub fn take_delay(&mut self) -> Option<Duration> {
        self.delay.take()
    }

    pub fn reserved_count(&self) -> u32 {
        self.reserved_count
    }

    /// Record one more reservation. Backends call this on every delivery.
    pub fn mark_reserved(&mut self) {
        self.reserved_count += 1;
    }

    pub fn set_reserved_count(&mut self, count: u32) {
        self.reserved_count = count;
    }

    pub fn receipt(&self) -> Option<&str> {
        self.receipt.as_deref()
    }
}
