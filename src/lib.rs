//! # queuectl
//!
//! Durable, multi-process background job queue on a single SQLite file.
//!
//! Clients enqueue shell commands; independent worker processes claim them
//! atomically, run them, and record outcomes. Failed jobs retry with
//! exponential backoff until their budget is spent, then move to the
//! dead-letter queue.

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod model;
pub mod retry;
pub mod supervisor;
pub mod telemetry;
pub mod worker;
