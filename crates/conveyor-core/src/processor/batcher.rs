//! Coalescing sink for batched deletions.
//!
//! Items accumulate until a size threshold or a staleness window flushes
//! them; flushes run as spawned tasks bounded by a semaphore, so at most
//! `concurrency` sink invocations are in flight at any time. `add` only
//! blocks while every flush slot is taken (backpressure).

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::error;

use crate::domain::Message;
use crate::error::ConveyorError;

const BATCH_SIZE: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Receives full batches from the [`Batcher`].
#[async_trait]
pub(crate) trait BatchSink: Send + Sync {
    async fn flush(&self, batch: Vec<Message>) -> Result<(), ConveyorError>;
}

#[derive(Clone)]
pub(crate) struct Batcher {
    inner: Arc<BatcherInner>,
}

struct BatcherInner {
    sink: Arc<dyn BatchSink>,
    slots: Arc<Semaphore>,
    buf: Mutex<Vec<Message>>,
    in_flight: AtomicUsize,
    flush_done: Notify,
    first_err: Mutex<Option<ConveyorError>>,
    timer_armed: AtomicBool,
}

impl Batcher {
    pub fn new(concurrency: usize, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                sink,
                slots: Arc::new(Semaphore::new(concurrency.max(1))),
                buf: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                flush_done: Notify::new(),
                first_err: Mutex::new(None),
                timer_armed: AtomicBool::new(false),
            }),
        }
    }

    /// Buffer one item, flushing if the batch is full. Blocks only while
    /// all flush slots are busy.
    pub async fn add(&self, msg: Message) {
        let full_batch = {
            let mut buf = self.inner.buf.lock().await;
            buf.push(msg);
            if buf.len() >= BATCH_SIZE {
                Some(mem::take(&mut *buf))
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            self.dispatch(batch).await;
        } else if !self.inner.timer_armed.swap(true, Ordering::AcqRel) {
            // First pending item arms a staleness timer so a trickle of
            // items still flushes within a bounded window.
            let batcher = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(FLUSH_INTERVAL).await;
                batcher.inner.timer_armed.store(false, Ordering::Release);
                batcher.flush_pending().await;
            });
        }
    }

    /// Flush whatever is buffered and wait for every flush issued so far.
    /// Returns the first flush error recorded since the previous wait.
    pub async fn wait(&self) -> Result<(), ConveyorError> {
        self.flush_pending().await;
        loop {
            let done = self.inner.flush_done.notified();
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
            done.await;
        }
        match self.inner.first_err.lock().await.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn flush_pending(&self) {
        let batch = mem::take(&mut *self.inner.buf.lock().await);
        if !batch.is_empty() {
            self.dispatch(batch).await;
        }
    }

    async fn dispatch(&self, batch: Vec<Message>) {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let permit = match self.inner.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("batcher semaphore closed, dropping batch");
                self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.inner.flush_done.notify_waiters();
                return;
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.sink.flush(batch).await {
                let mut first = inner.first_err.lock().await;
                if first.is_none() {
                    *first = Some(err);
                }
            }
            drop(permit);
            inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            inner.flush_done.notify_waiters();
        });
    }
}
