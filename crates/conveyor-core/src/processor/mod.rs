//! The message-processing engine.
//!
//! A processor reserves messages from its queue, dispatches them to the
//! handler through a pool of workers, and settles every message exactly
//! once: release back to the queue (with a retry delay) or batched
//! deletion. Flow:
//!
//! `Queuer::reserve_n` -> fetcher -> bounded buffer -> worker -> handler
//! -> release | batcher -> `Queuer::delete_batch`

mod backoff;
mod batcher;
mod options;
mod pause;
mod stats;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::Message;
use crate::error::ConveyorError;
use crate::handler::{Handler, HandlerError};
use crate::observability::ProcessorStats;
use crate::queue::Queuer;

pub use backoff::MAX_BACKOFF;
pub use options::Options;

use batcher::{BatchSink, Batcher};
use pause::{PauseController, LONG_DELAY};
use stats::Counters;

/// Sleep after a failed reserve before trying again.
pub const CONSUMER_BACKOFF: Duration = Duration::from_secs(1);

/// Default deadline for [`Processor::stop`].
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Reserves messages from a queue, dispatches them to the handler, and
/// settles each one by releasing or deleting it.
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Arc<dyn Queuer>,
    opt: Options,
    handler: Arc<dyn Handler>,

    ch_tx: mpsc::Sender<Message>,
    ch_rx: Mutex<mpsc::Receiver<Message>>,

    counters: Arc<Counters>,
    pause: PauseController,
    del_batch: Batcher,

    started: AtomicBool,
    run: std::sync::Mutex<Option<Run>>,
}

/// Live resources of one start/stop cycle.
struct Run {
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Batch sink bound to the queue's `delete_batch`. Holding only the queue
/// and counters (not the processor) keeps the ownership acyclic.
struct DeleteSink {
    queue: Arc<dyn Queuer>,
    counters: Arc<Counters>,
}

#[async_trait]
impl BatchSink for DeleteSink {
    async fn flush(&self, batch: Vec<Message>) -> Result<(), ConveyorError> {
        let n = batch.len() as u32;
        if let Err(err) = self.queue.delete_batch(&batch).await {
            // The queue redelivers after its visibility timeout.
            warn!(queue = self.queue.name(), error = %err, "batch delete failed");
        }
        self.counters.dec_deleting(n);
        Ok(())
    }
}

impl Processor {
    pub fn new(queue: Arc<dyn Queuer>, handler: Arc<dyn Handler>, mut opt: Options) -> Self {
        opt.init();

        let counters = Arc::new(Counters::default());
        let (ch_tx, ch_rx) = mpsc::channel(opt.buffer_size);
        let sink = Arc::new(DeleteSink {
            queue: queue.clone(),
            counters: counters.clone(),
        });
        let del_batch = Batcher::new(opt.scavenger_number, sink);

        Self {
            inner: Arc::new(Inner {
                queue,
                opt,
                handler,
                ch_tx,
                ch_rx: Mutex::new(ch_rx),
                counters,
                pause: PauseController::default(),
                del_batch,
                started: AtomicBool::new(false),
                run: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Spawn workers and the fetcher. A no-op when already started.
    pub fn start(&self) {
        if !self.start_workers() {
            return;
        }
        let mut run = self.inner.run.lock().unwrap();
        if let Some(run) = run.as_mut() {
            let inner = self.inner.clone();
            let stop_rx = run.stop_rx.clone();
            run.handles.push(tokio::spawn(Self::fetcher(inner, stop_rx)));
        }
    }

    fn start_workers(&self) -> bool {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.inner.opt.worker_number);
        for _ in 0..self.inner.opt.worker_number {
            let inner = self.inner.clone();
            let stop_rx = stop_rx.clone();
            handles.push(tokio::spawn(Self::worker(inner, stop_rx)));
        }
        info!(
            queue = self.inner.queue.name(),
            workers = self.inner.opt.worker_number,
            "processor started"
        );

        *self.inner.run.lock().unwrap() = Some(Run {
            stop_tx,
            stop_rx,
            handles,
        });
        true
    }

    /// [`Self::stop_timeout`] with the default 30 second deadline.
    pub async fn stop(&self) -> Result<(), ConveyorError> {
        self.stop_timeout(STOP_TIMEOUT).await
    }

    /// Signal shutdown, wait up to `timeout` for workers and fetcher to
    /// drain, then flush pending deletions. A no-op when not started.
    /// [`ConveyorError::StopTimeout`] is the only possible error.
    pub async fn stop_timeout(&self, timeout: Duration) -> Result<(), ConveyorError> {
        if self
            .inner
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let run = self.inner.run.lock().unwrap().take();
        let Some(run) = run else {
            return Ok(());
        };
        let _ = run.stop_tx.send(true);

        let joined = tokio::time::timeout(timeout, async {
            for handle in run.handles {
                let _ = handle.await;
            }
        })
        .await;
        if joined.is_err() {
            return Err(ConveyorError::StopTimeout(timeout));
        }

        self.inner.del_batch.wait().await?;
        info!(queue = self.inner.queue.name(), "processor stopped");
        Ok(())
    }

    /// Run workers (without a fetcher) until the queue stays empty for two
    /// consecutive fetch cycles, then stop.
    pub async fn process_all(&self) -> Result<(), ConveyorError> {
        self.start_workers();
        let mut no_work = 0;
        loop {
            let was_idle = self.inner.counters.in_flight() == 0;
            let mut not_supported = false;
            let fetched = match Self::fetch_messages(&self.inner).await {
                Ok(n) => n,
                Err(ConveyorError::NotSupported) => {
                    not_supported = true;
                    0
                }
                Err(err) => return Err(err),
            };

            if fetched == 0 && was_idle {
                no_work += 1;
            } else {
                no_work = 0;
            }
            if no_work == 2 {
                break;
            }
            if not_supported {
                // Push-only queue: give buffered work time to drain.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        self.stop_timeout(STOP_TIMEOUT).await
    }

    /// Process at most one message: buffered first, then freshly reserved.
    /// Returns [`ConveyorError::Empty`] when there is no work.
    pub async fn process_one(&self) -> Result<(), ConveyorError> {
        let msg = self.reserve_one().await?;
        let result = Self::process_message(&self.inner, msg).await;
        let flushed = self.inner.del_batch.wait().await;
        result.and(flushed)
    }

    async fn reserve_one(&self) -> Result<Message, ConveyorError> {
        if let Ok(msg) = self.inner.ch_rx.lock().await.try_recv() {
            return Ok(msg);
        }

        let msgs = match self.inner.queue.reserve_n(1).await {
            Ok(msgs) => msgs,
            Err(ConveyorError::NotSupported) => Vec::new(),
            Err(err) => return Err(err),
        };
        let Some(msg) = msgs.into_iter().next() else {
            return Err(ConveyorError::Empty);
        };
        self.inner.counters.incr_in_flight();
        Ok(msg)
    }

    /// Enqueue a message into the internal buffer, bypassing the backend.
    pub async fn add(&self, msg: Message) -> Result<(), ConveyorError> {
        Self::queue_message(&self.inner, msg).await;
        Ok(())
    }

    /// Enqueue a message after `delay`. The timer is not cancelled by
    /// stop; a message firing into a full buffer after stop is dropped
    /// locally and left to the backend's redelivery.
    pub async fn add_delay(&self, msg: Message, delay: Duration) -> Result<(), ConveyorError> {
        if delay.is_zero() {
            return self.add(msg).await;
        }

        self.inner.counters.incr_in_flight();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match inner.ch_tx.try_send(msg) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(msg)) => {
                    if inner.started.load(Ordering::Acquire) {
                        if inner.ch_tx.send(msg).await.is_err() {
                            inner.counters.dec_in_flight();
                        }
                    } else {
                        inner.counters.dec_in_flight();
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    inner.counters.dec_in_flight();
                }
            }
        });
        Ok(())
    }

    /// Discard buffered messages without invoking the handler; each one is
    /// acknowledged through the batched delete path.
    pub async fn purge(&self) -> Result<(), ConveyorError> {
        loop {
            let buffered = self.inner.ch_rx.lock().await.try_recv();
            match buffered {
                Ok(msg) => Self::delete(&self.inner, msg, None).await,
                Err(_) => return Ok(()),
            }
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        self.inner.counters.snapshot()
    }

    /// Dispatch one message, bypassing the internal buffer.
    pub async fn process(&self, msg: Message) -> Result<(), ConveyorError> {
        Self::process_message(&self.inner, msg).await
    }

    async fn fetcher(inner: Arc<Inner>, stop_rx: watch::Receiver<bool>) {
        loop {
            if *stop_rx.borrow() {
                break;
            }

            let pause = inner.pause.pause_duration();
            if !pause.is_zero() {
                inner.pause.reset();
                info!(queue = inner.queue.name(), pause = ?pause, "fetcher paused");
                tokio::time::sleep(pause).await;
                continue;
            }

            match Self::fetch_messages(&inner).await {
                Ok(_) => {}
                Err(ConveyorError::NotSupported) => break,
                Err(err) => {
                    warn!(
                        queue = inner.queue.name(),
                        error = %err,
                        backoff = ?CONSUMER_BACKOFF,
                        "reserve failed"
                    );
                    tokio::time::sleep(CONSUMER_BACKOFF).await;
                }
            }
        }
    }

    async fn fetch_messages(inner: &Arc<Inner>) -> Result<usize, ConveyorError> {
        let msgs = inner.queue.reserve_n(inner.opt.buffer_size).await?;
        let n = msgs.len();
        for msg in msgs {
            Self::queue_message(inner, msg).await;
        }
        Ok(n)
    }

    async fn queue_message(inner: &Inner, msg: Message) {
        inner.counters.incr_in_flight();
        if inner.ch_tx.send(msg).await.is_err() {
            inner.counters.dec_in_flight();
        }
    }

    async fn worker(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>) {
        while let Some(msg) = Self::dequeue(&inner, &mut stop_rx).await {
            if let (Some(limiter), Some(limit)) =
                (inner.opt.rate_limiter.as_ref(), inner.opt.rate_limit)
            {
                loop {
                    let (delay, allowed) = limiter.allow_rate(inner.queue.name(), limit);
                    if allowed {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                }
            }

            let _ = Self::process_message(&inner, msg).await;
        }
    }

    /// Wait for a message or the stop signal. A stop still drains messages
    /// that were already buffered, so nothing enqueued before the signal is
    /// silently dropped.
    async fn dequeue(inner: &Inner, stop_rx: &mut watch::Receiver<bool>) -> Option<Message> {
        let mut rx = inner.ch_rx.lock().await;
        if *stop_rx.borrow() {
            return rx.try_recv().ok();
        }

        let received = tokio::select! {
            msg = rx.recv() => msg,
            _ = stop_rx.changed() => None,
        };
        match received {
            Some(msg) => Some(msg),
            None => rx.try_recv().ok(),
        }
    }

    async fn process_message(inner: &Arc<Inner>, msg: Message) -> Result<(), ConveyorError> {
        if msg.delay().is_some_and(|d| !d.is_zero()) {
            Self::release(inner, msg, None).await;
            return Ok(());
        }

        let start = Instant::now();
        let result = inner.handler.handle(&msg).await;
        inner.counters.observe_duration(start.elapsed());

        match result {
            Ok(()) => {
                inner.counters.incr_processed();
                Self::delete(inner, msg, None).await;
                Ok(())
            }
            Err(err) => {
                inner.pause.note_error();
                if msg.reserved_count() < inner.opt.retry_limit {
                    inner.counters.incr_retries();
                    Self::release(inner, msg, Some(&err)).await;
                } else {
                    inner.counters.incr_fails();
                    Self::delete(inner, msg, Some(&err)).await;
                }
                Err(err.into())
            }
        }
    }

    /// Return the message to the queue with a retry delay. Exactly one of
    /// release/delete runs per dispatched message.
    async fn release(inner: &Inner, msg: Message, reason: Option<&HandlerError>) {
        let delay = Self::release_backoff(inner, &msg, reason);
        if let Some(err) = reason {
            warn!(
                queue = inner.queue.name(),
                message = %msg.id(),
                error = %err,
                retry_in = ?delay,
                "handler failed, releasing message"
            );
        }
        if let Err(err) = inner.queue.release(&msg, delay).await {
            warn!(queue = inner.queue.name(), error = %err, "release failed");
        }
        inner.counters.dec_in_flight();
    }

    /// Delay precedence: explicit delay on the error, then the message's
    /// own schedule, then exponential backoff.
    fn release_backoff(inner: &Inner, msg: &Message, reason: Option<&HandlerError>) -> Duration {
        if let Some(delay) = reason.and_then(HandlerError::delay) {
            if delay > LONG_DELAY {
                inner.pause.note_long_delay(delay);
            }
            return delay;
        }
        if let Some(delay) = msg.delay() {
            if !delay.is_zero() {
                return delay;
            }
        }
        backoff::exponential_backoff(inner.opt.min_backoff, msg.reserved_count())
    }

    /// Acknowledge the message through the batched delete path, invoking
    /// the fallback handler first when the retry budget was exhausted.
    async fn delete(inner: &Inner, msg: Message, reason: Option<&HandlerError>) {
        match reason {
            None => inner.pause.reset(),
            Some(err) => {
                warn!(
                    queue = inner.queue.name(),
                    message = %msg.id(),
                    error = %err,
                    "handler failed, deleting message"
                );
                if let Some(fallback) = &inner.opt.fallback_handler {
                    if let Err(err) = fallback.handle(&msg).await {
                        warn!(queue = inner.queue.name(), error = %err, "fallback handler failed");
                    }
                }
            }
        }

        inner.counters.dec_in_flight();
        inner.counters.incr_deleting();
        inner.del_batch.add(msg).await;
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Processor<{} workers={} scavengers={} buffer={}>",
            self.inner.queue.name(),
            self.inner.opt.worker_number,
            self.inner.opt.scavenger_number,
            self.inner.opt.buffer_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;
    use tokio::time::sleep;

    use crate::domain::MessageId;

    /// Pull-based queue double. `redeliver` controls whether released
    /// messages become reservable again (immediately, ignoring the delay).
    struct FakeQueue {
        ready: StdMutex<VecDeque<Message>>,
        redeliver: bool,
        released: AtomicU32,
        deleted: AtomicU32,
        last_release_delay: StdMutex<Option<Duration>>,
    }

    impl FakeQueue {
        fn new(redeliver: bool) -> Arc<Self> {
            Arc::new(Self {
                ready: StdMutex::new(VecDeque::new()),
                redeliver,
                released: AtomicU32::new(0),
                deleted: AtomicU32::new(0),
                last_release_delay: StdMutex::new(None),
            })
        }

        fn seed(&self, n: usize) {
            let mut ready = self.ready.lock().unwrap();
            for i in 0..n {
                ready.push_back(Message::new("test", json!({ "i": i })));
            }
        }

        fn remaining(&self) -> usize {
            self.ready.lock().unwrap().len()
        }

        fn released(&self) -> u32 {
            self.released.load(Ordering::SeqCst)
        }

        fn deleted(&self) -> u32 {
            self.deleted.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Queuer for FakeQueue {
        fn name(&self) -> &str {
            "fake"
        }

        async fn add(&self, msg: Message) -> Result<(), ConveyorError> {
            self.ready.lock().unwrap().push_back(msg);
            Ok(())
        }

        async fn reserve_n(&self, n: usize) -> Result<Vec<Message>, ConveyorError> {
            let msgs: Vec<Message> = {
                let mut ready = self.ready.lock().unwrap();
                let take = n.min(ready.len());
                ready
                    .drain(..take)
                    .map(|mut msg| {
                        msg.mark_reserved();
                        msg
                    })
                    .collect()
            };
            if msgs.is_empty() {
                // Long-poll like a real backend would.
                sleep(Duration::from_millis(1)).await;
            }
            Ok(msgs)
        }

        async fn release(&self, msg: &Message, delay: Duration) -> Result<(), ConveyorError> {
            self.released.fetch_add(1, Ordering::SeqCst);
            *self.last_release_delay.lock().unwrap() = Some(delay);
            if self.redeliver {
                self.ready.lock().unwrap().push_back(msg.clone());
            }
            Ok(())
        }

        async fn delete(&self, _msg: &Message) -> Result<(), ConveyorError> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_batch(&self, msgs: &[Message]) -> Result<(), ConveyorError> {
            self.deleted.fetch_add(msgs.len() as u32, Ordering::SeqCst);
            Ok(())
        }

        async fn purge(&self) -> Result<(), ConveyorError> {
            self.ready.lock().unwrap().clear();
            Ok(())
        }
    }

    struct OkHandler;

    #[async_trait]
    impl Handler for OkHandler {
        async fn handle(&self, _msg: &Message) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    /// Fails the first `failures` invocations of each message.
    struct FlakyHandler {
        failures: u32,
        attempts: StdMutex<HashMap<MessageId, u32>>,
    }

    impl FlakyHandler {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                attempts: StdMutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl Handler for FlakyHandler {
        async fn handle(&self, msg: &Message) -> Result<(), HandlerError> {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(msg.id()).or_insert(0);
            *n += 1;
            if *n <= self.failures {
                Err(HandlerError::failed(format!("attempt {n}")))
            } else {
                Ok(())
            }
        }
    }

    struct CountingHandler {
        calls: AtomicU32,
        result: Result<(), HandlerError>,
    }

    impl CountingHandler {
        fn new(result: Result<(), HandlerError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                result,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _msg: &Message) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    /// Signals entry, then blocks for a long time.
    struct StuckHandler {
        entered: AtomicU32,
    }

    #[async_trait]
    impl Handler for StuckHandler {
        async fn handle(&self, _msg: &Message) -> Result<(), HandlerError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn fast_options(workers: usize) -> Options {
        Options {
            worker_number: workers,
            min_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 5s");
    }

    #[tokio::test]
    async fn happy_path_processes_everything() {
        let queue = FakeQueue::new(false);
        queue.seed(100);
        let p = Processor::new(queue.clone(), Arc::new(OkHandler), fast_options(4));

        p.start();
        let stats_p = p.clone();
        wait_until(move || stats_p.stats().processed == 100).await;
        p.stop().await.unwrap();

        let stats = p.stats();
        assert_eq!(stats.processed, 100);
        assert_eq!(stats.retries, 0);
        assert_eq!(stats.fails, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.deleting, 0);
        assert_eq!(queue.deleted(), 100);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let queue = FakeQueue::new(true);
        queue.seed(10);
        let opt = Options {
            retry_limit: 5,
            ..fast_options(4)
        };
        let p = Processor::new(queue.clone(), Arc::new(FlakyHandler::new(2)), opt);

        p.start();
        let stats_p = p.clone();
        wait_until(move || stats_p.stats().processed == 10).await;
        p.stop().await.unwrap();

        let stats = p.stats();
        assert_eq!(stats.retries, 20);
        assert_eq!(stats.fails, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(queue.released(), 20);
        assert_eq!(queue.deleted(), 10);
    }

    #[tokio::test]
    async fn exhausted_retries_hit_the_fallback() {
        let queue = FakeQueue::new(true);
        queue.seed(5);
        let fallback = CountingHandler::new(Ok(()));
        let opt = Options {
            retry_limit: 3,
            fallback_handler: Some(fallback.clone()),
            ..fast_options(2)
        };
        let p = Processor::new(
            queue.clone(),
            CountingHandler::new(Err(HandlerError::failed("boom"))),
            opt,
        );

        p.start();
        let stats_p = p.clone();
        wait_until(move || stats_p.stats().fails == 5).await;
        p.stop().await.unwrap();

        let stats = p.stats();
        assert_eq!(stats.fails, 5);
        assert_eq!(stats.retries, 10);
        assert_eq!(stats.processed, 0);
        assert_eq!(fallback.calls(), 5);
        assert_eq!(queue.deleted(), 5);
    }

    #[tokio::test]
    async fn explicit_delay_drives_release_and_pause() {
        let queue = FakeQueue::new(false);
        queue.seed(1);
        let handler = CountingHandler::new(Err(HandlerError::deferred(
            Duration::from_secs(120),
            "upstream throttled",
        )));
        let p = Processor::new(queue.clone(), handler, fast_options(1));

        p.start();
        let released_queue = queue.clone();
        wait_until(move || released_queue.released() == 1).await;
        p.stop().await.unwrap();

        assert_eq!(
            *queue.last_release_delay.lock().unwrap(),
            Some(Duration::from_secs(120))
        );
        assert_eq!(p.inner.pause.delay_sec(), 120);
        assert_eq!(p.inner.pause.delay_count(), 1);
        assert_eq!(p.stats().retries, 1);
        assert_eq!(p.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn message_delay_skips_the_handler() {
        let queue = FakeQueue::new(false);
        queue
            .ready
            .lock()
            .unwrap()
            .push_back(Message::new("later", json!({})).delayed(Duration::from_millis(150)));
        let handler = CountingHandler::new(Ok(()));
        let p = Processor::new(queue.clone(), handler.clone(), fast_options(1));

        p.start();
        let released_queue = queue.clone();
        wait_until(move || released_queue.released() == 1).await;
        p.stop().await.unwrap();

        assert_eq!(handler.calls(), 0);
        assert_eq!(
            *queue.last_release_delay.lock().unwrap(),
            Some(Duration::from_millis(150))
        );
        assert_eq!(p.stats().retries, 0);
        assert_eq!(p.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn add_delay_delivers_after_the_delay() {
        let queue = FakeQueue::new(false);
        let p = Processor::new(queue, Arc::new(OkHandler), fast_options(1));
        p.start();

        let started_at = Instant::now();
        p.add_delay(Message::new("later", json!({})), Duration::from_millis(200))
            .await
            .unwrap();

        let stats_p = p.clone();
        wait_until(move || stats_p.stats().processed == 1).await;
        assert!(started_at.elapsed() >= Duration::from_millis(200));

        p.stop().await.unwrap();
        assert_eq!(p.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn clean_stop_accounts_for_every_message() {
        let queue = FakeQueue::new(false);
        queue.seed(300);
        let p = Processor::new(queue.clone(), Arc::new(OkHandler), fast_options(4));

        p.start();
        sleep(Duration::from_millis(20)).await;
        p.stop_timeout(Duration::from_secs(5)).await.unwrap();

        let stats = p.stats();
        assert_eq!(stats.fails, 0);
        assert_eq!(stats.deleting, 0);
        assert_eq!(queue.deleted(), stats.processed);
        assert_eq!(
            stats.processed + stats.in_flight + queue.remaining() as u32,
            300
        );
    }

    #[tokio::test]
    async fn stop_times_out_on_a_stuck_handler() {
        let queue = FakeQueue::new(false);
        queue.seed(1);
        let handler = Arc::new(StuckHandler {
            entered: AtomicU32::new(0),
        });
        let p = Processor::new(queue, handler.clone(), fast_options(1));

        p.start();
        let entered = handler.clone();
        wait_until(move || entered.entered.load(Ordering::SeqCst) == 1).await;

        let err = p.stop_timeout(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ConveyorError::StopTimeout(_)));

        // Already stopped: a second stop is a no-op success.
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent_across_cycles() {
        let queue = FakeQueue::new(false);
        let p = Processor::new(queue.clone(), Arc::new(OkHandler), fast_options(2));

        p.start();
        p.start();
        p.stop().await.unwrap();
        p.stop().await.unwrap();

        queue.seed(3);
        p.start();
        let stats_p = p.clone();
        wait_until(move || stats_p.stats().processed == 3).await;
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn purge_discards_without_invoking_the_handler() {
        let queue = FakeQueue::new(false);
        let handler = CountingHandler::new(Ok(()));
        let opt = Options {
            buffer_size: 64,
            ..fast_options(1)
        };
        let p = Processor::new(queue.clone(), handler.clone(), opt);

        for i in 0..25 {
            p.add(Message::new("test", json!({ "i": i }))).await.unwrap();
        }
        p.purge().await.unwrap();
        p.inner.del_batch.wait().await.unwrap();

        assert_eq!(handler.calls(), 0);
        assert_eq!(queue.deleted(), 25);
        assert_eq!(p.stats().in_flight, 0);
        assert_eq!(p.stats().deleting, 0);
    }

    #[tokio::test]
    async fn process_one_reports_an_empty_queue() {
        let queue = FakeQueue::new(false);
        let p = Processor::new(queue, Arc::new(OkHandler), fast_options(1));
        let err = p.process_one().await.unwrap_err();
        assert!(matches!(err, ConveyorError::Empty));
    }

    #[tokio::test]
    async fn process_one_reserves_and_settles_a_message() {
        let queue = FakeQueue::new(false);
        queue.seed(1);
        let p = Processor::new(queue.clone(), Arc::new(OkHandler), fast_options(1));

        p.process_one().await.unwrap();

        assert_eq!(p.stats().processed, 1);
        assert_eq!(queue.deleted(), 1);
        assert_eq!(p.stats().deleting, 0);
    }

    #[tokio::test]
    async fn process_one_prefers_the_buffer() {
        let queue = FakeQueue::new(false);
        let p = Processor::new(queue.clone(), Arc::new(OkHandler), fast_options(1));

        p.add(Message::new("buffered", json!({}))).await.unwrap();
        p.process_one().await.unwrap();

        assert_eq!(p.stats().processed, 1);
        assert_eq!(queue.remaining(), 0);
    }

    #[tokio::test]
    async fn process_all_drains_the_queue_and_stops() {
        let queue = FakeQueue::new(false);
        queue.seed(20);
        let p = Processor::new(queue.clone(), Arc::new(OkHandler), fast_options(2));

        p.process_all().await.unwrap();

        assert_eq!(p.stats().processed, 20);
        assert_eq!(queue.deleted(), 20);
        assert!(!p.inner.started.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn rate_limited_workers_still_drain_the_queue() {
        use crate::rate_limit::{LocalRateLimiter, RateLimit};

        let queue = FakeQueue::new(false);
        queue.seed(6);
        let opt = Options {
            rate_limit: Some(RateLimit {
                events: 2,
                per: Duration::from_millis(50),
            }),
            rate_limiter: Some(Arc::new(LocalRateLimiter::new())),
            ..fast_options(2)
        };
        let p = Processor::new(queue.clone(), Arc::new(OkHandler), opt);

        let started_at = Instant::now();
        p.start();
        let stats_p = p.clone();
        wait_until(move || stats_p.stats().processed == 6).await;
        p.stop().await.unwrap();

        // Six messages at two per window need at least two extra windows.
        assert!(started_at.elapsed() >= Duration::from_millis(90));
        assert_eq!(queue.deleted(), 6);
    }

    #[tokio::test]
    async fn display_includes_the_tuning() {
        let queue = FakeQueue::new(false);
        let opt = Options {
            worker_number: 4,
            scavenger_number: 2,
            buffer_size: 10,
            ..Default::default()
        };
        let p = Processor::new(queue, Arc::new(OkHandler), opt);
        assert_eq!(p.to_string(), "Processor<fake workers=4 scavengers=2 buffer=10>");
    }
}
