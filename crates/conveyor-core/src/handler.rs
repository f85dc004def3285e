//! Handler surface: how user code consumes messages.
//!
//! Two levels:
//! - [`Handler`] works on the raw [`Message`] (the processor's view).
//! - [`TaskHandler`] works on a decoded payload type; [`TypedHandler`]
//!   erases the payload type so it can be stored as a `dyn Handler`.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::domain::Message;

/// Why a handler invocation failed.
///
/// `Deferred` carries an explicit retry delay chosen by the handler
/// ("the upstream API told us to come back in two minutes"). The
/// processor uses it instead of the exponential backoff, and long delays
/// feed the fetcher's adaptive pause.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("{reason} (deferred for {delay:?})")]
    Deferred { delay: Duration, reason: String },
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn deferred(delay: Duration, reason: impl Into<String>) -> Self {
        Self::Deferred {
            delay,
            reason: reason.into(),
        }
    }

    /// The explicit retry delay, when this failure carries one.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Deferred { delay, .. } => Some(*delay),
            Self::Failed(_) => None,
        }
    }
}

/// A handler for messages of a queue.
///
/// The same trait serves as the fallback handler invoked when a message
/// exhausts its retry budget (dead-letter-style processing).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, msg: &Message) -> Result<(), HandlerError>;
}

/// A handler for a decoded payload type.
#[async_trait]
pub trait TaskHandler<T: Send + 'static>: Send + Sync {
    async fn run(&self, args: T) -> Result<(), HandlerError>;
}

/// Adapts a [`TaskHandler`] into a [`Handler`] by decoding the message
/// args into `T` first. Decode failures surface as handler failures, so
/// malformed payloads follow the normal retry/fail path.
pub struct TypedHandler<T, H> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T, H> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> Handler for TypedHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: TaskHandler<T>,
{
    async fn handle(&self, msg: &Message) -> Result<(), HandlerError> {
        let args: T = serde_json::from_value(msg.args().clone())
            .map_err(|e| HandlerError::failed(format!("args decode: {e}")))?;
        self.handler.run(args).await
    }
}

/// A [`Handler`] built from a plain async closure.
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, msg: &Message) -> Result<(), HandlerError> {
        (self.0)(msg.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}
