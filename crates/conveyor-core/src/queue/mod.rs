//! Queuer contract and the in-memory backend.

pub mod memory;

pub use memory::MemoryQueue;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::Message;
use crate::error::ConveyorError;

/// The contract the processor requires of a backing queue.
///
/// Design intent:
/// - The queue owns durability and visibility; the processor owns
///   dispatch, retry classification, and batching.
/// - Pull-based backends implement `reserve_n`; push-only backends (like
///   [`MemoryQueue`]) return [`ConveyorError::NotSupported`] from it and
///   feed the processor directly.
/// - `release` makes a reserved message visible again after `delay`;
///   `delete`/`delete_batch` acknowledge it permanently.
#[async_trait]
pub trait Queuer: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a message for future reservation.
    async fn add(&self, msg: Message) -> Result<(), ConveyorError>;

    /// Reserve up to `n` messages with a visibility timeout.
    async fn reserve_n(&self, n: usize) -> Result<Vec<Message>, ConveyorError>;

    /// Return a reserved message to the queue, visible again after `delay`.
    async fn release(&self, msg: &Message, delay: Duration) -> Result<(), ConveyorError>;

    /// Acknowledge one message.
    async fn delete(&self, msg: &Message) -> Result<(), ConveyorError>;

    /// Acknowledge a batch of messages.
    async fn delete_batch(&self, msgs: &[Message]) -> Result<(), ConveyorError>;

    /// Optional housekeeping: drop everything queued.
    async fn purge(&self) -> Result<(), ConveyorError>;
}
