//! Worker module - Runs checkers over ranges of values
//!
//! Provides:
//! - Checker capability and the resolver turning references into checkers
//! - A bounded executor applying a per-batch deadline
//! - Result sinks that persist verdicts

mod checker;
mod executor;
mod sink;

pub use checker::*;
pub use executor::*;
pub use sink::*;

use std::time::Duration;

use crate::protocol::{CheckerRef, Id, Range, Response};

/// One batch of values to check on behalf of `requester`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub requester: Id,
    pub request_id: u64,
    pub checker: CheckerRef,
    pub range: Range,
}

/// Every verdict of a finished batch
#[derive(Debug, Clone)]
pub struct WorkOutcome {
    pub task: Task,
    pub responses: Vec<Response>,
}

/// Configuration for the executor pool
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Batches checked concurrently
    pub pool_size: usize,
    /// Time budget of one batch
    pub deadline: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            deadline: Duration::from_millis(10_000),
        }
    }
}
