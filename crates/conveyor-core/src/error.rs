use std::time::Duration;

use thiserror::Error;

use crate::handler::HandlerError;

#[derive(Debug, Error)]
pub enum ConveyorError {
    /// The backend does not implement the requested capability
    /// (e.g. pull-based reserve on a push-only queue).
    #[error("operation not supported by this queue")]
    NotSupported,

    /// No message is available right now (ProcessOne only).
    #[error("queue is empty")]
    Empty,

    /// Workers were still running when the stop deadline elapsed.
    #[error("workers did not stop within {0:?}")]
    StopTimeout(Duration),

    /// Transient backend failure (reserve/release/delete).
    #[error("queue backend: {0}")]
    Backend(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl ConveyorError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported)
    }
}
