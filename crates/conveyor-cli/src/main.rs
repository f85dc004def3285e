//! Demo: a typed handler on the in-memory queue.
//!
//! The handler fails twice before succeeding, so the run shows the retry
//! machinery (release with backoff, redelivery, stats) end to end.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use conveyor_core::domain::Message;
use conveyor_core::handler::{HandlerError, TaskHandler, TypedHandler};
use conveyor_core::processor::Options;
use conveyor_core::queue::{MemoryQueue, Queuer};

#[derive(Debug, Deserialize)]
struct Greet {
    name: String,
}

struct GreetHandler {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl TaskHandler<Greet> for GreetHandler {
    async fn run(&self, args: Greet) -> Result<(), HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::failed(format!(
                "intentional failure (left={left})"
            )));
        }
        println!("Hello, {}!", args.name);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let handler = Arc::new(TypedHandler::<Greet, _>::new(GreetHandler {
        remaining_failures: AtomicU32::new(2),
    }));
    let opt = Options {
        worker_number: 2,
        retry_limit: 5,
        min_backoff: Duration::from_millis(50),
        ..Default::default()
    };

    let queue = MemoryQueue::new("greetings", handler, opt);
    let processor = queue.processor().clone();
    processor.start();
    println!("started {processor}");

    queue
        .add(Message::new(
            "greet",
            serde_json::json!({ "name": "conveyor" }),
        ))
        .await
        .unwrap();

    // Wait for the message to make it through two retries and succeed.
    loop {
        let stats = processor.stats();
        if stats.processed >= 1 {
            println!(
                "processed={} retries={} fails={} avg={:?}",
                stats.processed, stats.retries, stats.fails, stats.avg_duration
            );
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    processor.stop().await.unwrap();
}
