//! # scanhive-shared
//!
//! Shared core of the scanhive vulnerability-scan service: the persistence
//! abstraction, the task store and state machine, the idempotency index, the
//! multi-pool queue with its dead-letter queue, the scanner registry, report
//! parsing/projection, configuration, and the error model.
//!
//! The `scanhive-api` crate builds the public operations surface on top of
//! these pieces; `scanhive-worker` builds the dispatch loop. Both receive
//! their collaborators explicitly — there are no process-wide singletons.

pub mod config;
pub mod error;
pub mod idempotency;
pub mod models;
pub mod queue;
pub mod registry;
pub mod report;
pub mod store;
pub mod tasks;
