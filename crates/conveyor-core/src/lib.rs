//! conveyor-core
//!
//! Core building blocks for the conveyor task queue.
//!
//! This crate is split into small focused modules:
//! - domain: message envelope and identifiers
//! - queue: Queuer contract + in-memory backend
//! - handler: handler surface and typed adapters
//! - processor: the message-processing engine
//! - rate_limit: rate limiter contract + local implementation
//! - observability: stats snapshots
//! - error: crate-level error type

pub mod domain;
pub mod error;
pub mod handler;
pub mod observability;
pub mod processor;
pub mod queue;
pub mod rate_limit;
