//! Bounded work executor
//!
//! At most `pool_size` batches run at once, each on a blocking thread. A
//! batch answers all of its values together; if it overruns its deadline
//! every value is reported as timed out instead. The deadline starts when the
//! batch is submitted, so time spent queued for a slot counts against it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

use super::checker::{Checker, CheckerResolver};
use super::{ExecutorConfig, Task, WorkOutcome};
use crate::protocol::{Range, Response};

/// Handle to the executor pool
#[derive(Clone)]
pub struct WorkExecutor {
    permits: Arc<Semaphore>,
    deadline: Duration,
    resolver: Arc<dyn CheckerResolver>,
    outcomes: mpsc::UnboundedSender<WorkOutcome>,
}

impl WorkExecutor {
    pub fn new(
        config: ExecutorConfig,
        resolver: Arc<dyn CheckerResolver>,
        outcomes: mpsc::UnboundedSender<WorkOutcome>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.pool_size.max(1))),
            deadline: config.deadline,
            resolver,
            outcomes,
        }
    }

    /// Queue `task`; its outcome arrives later on the outcome channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, task: Task) {
        let checker = match self.resolver.resolve(&task.checker) {
            Ok(checker) => checker,
            Err(e) => {
                tracing::warn!("Checker {} unavailable: {}", task.checker, e);
                let message = e.to_string();
                let responses = task
                    .range
                    .values()
                    .map(|value| Response::unavailable(value, message.clone()))
                    .collect();
                let _ = self.outcomes.send(WorkOutcome { task, responses });
                return;
            }
        };

        let permits = self.permits.clone();
        let deadline = self.deadline;
        let expires = Instant::now() + deadline;
        let outcomes = self.outcomes.clone();

        tokio::spawn(async move {
            let range = task.range;
            let permit = match tokio::time::timeout_at(expires, permits.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return,
                Err(_) => {
                    tracing::warn!(
                        "Request {} timed out on {} waiting for a free worker",
                        task.request_id,
                        range
                    );
                    let responses = range.values().map(Response::timeout).collect();
                    deliver(&outcomes, WorkOutcome { task, responses });
                    return;
                }
            };
            tracing::debug!(
                "Checking {} for request {} of {}",
                range,
                task.request_id,
                task.requester
            );

            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            let job = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                check_range(checker.as_ref(), range, &flag)
            });

            let responses = match tokio::time::timeout_at(expires, job).await {
                Ok(Ok(responses)) => responses,
                Ok(Err(e)) => {
                    tracing::error!("Checker task failed: {}", e);
                    range
                        .values()
                        .map(|value| Response::exception(value, "checker crashed"))
                        .collect()
                }
                Err(_) => {
                    cancel.store(true, Ordering::Relaxed);
                    tracing::warn!(
                        "Request {} timed out on {} after {:?}",
                        task.request_id,
                        range,
                        deadline
                    );
                    range.values().map(Response::timeout).collect()
                }
            };

            deliver(&outcomes, WorkOutcome { task, responses });
        });
    }
}

fn deliver(outcomes: &mpsc::UnboundedSender<WorkOutcome>, outcome: WorkOutcome) {
    if outcomes.send(outcome).is_err() {
        tracing::debug!("Outcome dropped, node loop is gone");
    }
}

fn check_range(checker: &dyn Checker, range: Range, cancel: &AtomicBool) -> Vec<Response> {
    let mut responses = Vec::new();
    for value in range.values() {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let response = match panic::catch_unwind(AssertUnwindSafe(|| checker.check(value))) {
            Ok(Ok(message)) => Response::done(value, message),
            Ok(Err(e)) => Response::exception(value, e.to_string()),
            Err(payload) => Response::exception(value, panic_message(payload.as_ref())),
        };
        responses.push(response);
    }
    responses
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("checker panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("checker panicked: {}", message)
    } else {
        "checker panicked".to_string()
    }
}
