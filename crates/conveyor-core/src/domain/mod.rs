//! Domain model (message envelope and identifiers).

pub mod message;

pub use message::{Message, MessageId};
