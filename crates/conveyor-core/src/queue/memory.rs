//! In-memory queue: push-only, process-local.
//!
//! Messages never rest in a store; `add` hands them straight to the
//! queue's own processor (optionally via a delay timer). Reservation is
//! not supported, so the processor's fetcher exits and delivery is driven
//! entirely by the push side. Deletes are no-ops: once handled, an
//! in-memory message simply ceases to exist.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::Message;
use crate::error::ConveyorError;
use crate::handler::Handler;
use crate::processor::{Options, Processor};

use super::Queuer;

pub struct MemoryQueue {
    name: String,
    processor: OnceLock<Processor>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, handler: Arc<dyn Handler>, opt: Options) -> Arc<Self> {
        let queue = Arc::new(Self {
            name: name.into(),
            processor: OnceLock::new(),
        });
        let processor = Processor::new(queue.clone(), handler, opt);
        let _ = queue.processor.set(processor);
        queue
    }

    pub fn processor(&self) -> &Processor {
        self.processor
            .get()
            .expect("processor wired at construction")
    }
}

#[async_trait]
impl Queuer for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, mut msg: Message) -> Result<(), ConveyorError> {
        // Every delivery counts as a reservation on this backend.
        if msg.reserved_count() == 0 {
            msg.set_reserved_count(1);
        }
        match msg.take_delay() {
            Some(delay) if !delay.is_zero() => self.processor().add_delay(msg, delay).await,
            _ => self.processor().add(msg).await,
        }
    }

    async fn reserve_n(&self, _n: usize) -> Result<Vec<Message>, ConveyorError> {
        Err(ConveyorError::NotSupported)
    }

    async fn release(&self, msg: &Message, delay: Duration) -> Result<(), ConveyorError> {
        let mut msg = msg.clone();
        msg.take_delay();
        msg.mark_reserved();
        self.processor().add_delay(msg, delay).await
    }

    async fn delete(&self, _msg: &Message) -> Result<(), ConveyorError> {
        Ok(())
    }

    async fn delete_batch(&self, _msgs: &[Message]) -> Result<(), ConveyorError> {
        Ok(())
    }

    async fn purge(&self) -> Result<(), ConveyorError> {
        self.processor().purge().await
    }
}
