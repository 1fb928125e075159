//! Parallel Executor
//!
//! Runs batches of [`ParallelTask`]s with a concurrency cap:
//! - Dispatch by priority (higher first, FIFO among equals)
//! - At most `max_concurrent` tasks in flight (semaphore permit taken
//!   before a worker is spawned)
//! - Per-task timeouts, with errors and panics captured as results
//! - Aggregation by [`AggregationStrategy`]

use std::any::Any;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};

use super::aggregation::{AggregatedResult, AggregationStrategy};
use super::task::{ExecutionResult, ParallelTask, TaskBody, TaskError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutorError {
    #[error("invalid executor configuration: {0}")]
    InvalidConfiguration(String),
}

/// Bounded-concurrency task runner.
#[derive(Debug, Clone, Default)]
pub struct ParallelExecutor {
    default_timeout: Option<Duration>,
}

impl ParallelExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeout applied to tasks that do not set their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Runs a batch and aggregates the results.
    ///
    /// With [`AggregationStrategy::First`] the call returns as soon as one
    /// task succeeds; tasks still running are not cancelled and their
    /// results are drained in the background.
    pub async fn submit(
        &self,
        mut tasks: Vec<ParallelTask>,
        strategy: AggregationStrategy,
        max_concurrent: usize,
    ) -> Result<AggregatedResult, ExecutorError> {
        validate_batch(&tasks, strategy, max_concurrent)?;

        let total = tasks.len();
        if total == 0 {
            return Ok(AggregatedResult {
                strategy,
                total,
                success: strategy.is_satisfied(0, 0),
                results: Vec::new(),
                first_success: None,
            });
        }

        info!(
            "Submitting {} tasks ({}, max {} concurrent)",
            total, strategy, max_concurrent
        );

        // Stable sort keeps submission order among equal priorities
        tasks.sort_by_key(|t| Reverse(t.priority()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let default_timeout = self.default_timeout;

        tokio::spawn(async move {
            for task in tasks {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let tx = tx.clone();
                let (task_id, timeout, body) = task.into_parts();
                let timeout = timeout.or(default_timeout);

                debug!("Dispatching task '{}'", task_id);
                tokio::spawn(async move {
                    let result = run_task(task_id, timeout, body).await;
                    drop(permit);
                    // The receiver is gone once a FIRST batch has returned and drained
                    let _ = tx.send(result);
                });
            }
        });

        let mut results = Vec::with_capacity(total);
        let mut first_success: Option<String> = None;

        while let Some(result) = rx.recv().await {
            if result.is_success() {
                if first_success.is_none() {
                    first_success = Some(result.task_id().to_string());
                }
            } else if let Some(err) = result.error() {
                warn!("{}", err);
            }
            results.push(result);

            if strategy == AggregationStrategy::First && first_success.is_some() {
                let outstanding = total - results.len();
                if outstanding > 0 {
                    tokio::spawn(drain_late_results(rx, outstanding));
                }
                break;
            }
            if results.len() == total {
                break;
            }
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let success = strategy.is_satisfied(succeeded, total);
        info!(
            "Batch finished: {}/{} succeeded, {} {}",
            succeeded,
            total,
            strategy,
            if success { "satisfied" } else { "not satisfied" }
        );

        Ok(AggregatedResult {
            strategy,
            total,
            success,
            results,
            first_success,
        })
    }
}

fn validate_batch(
    tasks: &[ParallelTask],
    strategy: AggregationStrategy,
    max_concurrent: usize,
) -> Result<(), ExecutorError> {
    if max_concurrent == 0 {
        return Err(ExecutorError::InvalidConfiguration(
            "max_concurrent must be at least 1".to_string(),
        ));
    }

    if let AggregationStrategy::Threshold(n) = strategy {
        if n == 0 {
            return Err(ExecutorError::InvalidConfiguration(
                "threshold must be at least 1".to_string(),
            ));
        }
        if n > tasks.len() {
            return Err(ExecutorError::InvalidConfiguration(format!(
                "threshold {} exceeds batch size {}",
                n,
                tasks.len()
            )));
        }
    }

    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.id()) {
            return Err(ExecutorError::InvalidConfiguration(format!(
                "duplicate task id '{}'",
                task.id()
            )));
        }
    }

    Ok(())
}

async fn run_task(task_id: String, timeout: Option<Duration>, body: TaskBody) -> ExecutionResult {
    let started_at = Utc::now();
    let guarded = AssertUnwindSafe(async move { body().await }).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(caught) => caught,
            Err(_) => {
                let error = TaskError::Timeout {
                    task_id: task_id.clone(),
                    timeout: limit,
                };
                return ExecutionResult::new(task_id, Err(error), started_at, Utc::now());
            }
        },
        None => guarded.await,
    };

    let outcome = match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::Execution {
            task_id: task_id.clone(),
            message: e.to_string(),
        }),
        Err(panic) => Err(TaskError::Execution {
            task_id: task_id.clone(),
            message: format!("task panicked: {}", panic_message(panic.as_ref())),
        }),
    };

    ExecutionResult::new(task_id, outcome, started_at, Utc::now())
}

async fn drain_late_results(mut rx: mpsc::UnboundedReceiver<ExecutionResult>, outstanding: usize) {
    for _ in 0..outstanding {
        match rx.recv().await {
            Some(late) => debug!(
                "Late result for '{}' after batch returned (success: {})",
                late.task_id(),
                late.is_success()
            ),
            None => break,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
