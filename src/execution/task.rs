//! Parallel Tasks
//!
//! A [`ParallelTask`] is a one-shot asynchronous unit of work submitted to
//! the [`ParallelExecutor`](super::ParallelExecutor). Every dispatched task
//! produces exactly one [`ExecutionResult`].

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;

/// What a task body resolves to.
pub type TaskOutput = Result<Value, Box<dyn Error + Send + Sync>>;

pub(crate) type TaskBody = Box<dyn FnOnce() -> BoxFuture<'static, TaskOutput> + Send>;

/// Why a task did not produce a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("task '{task_id}' timed out after {timeout:?}")]
    Timeout { task_id: String, timeout: Duration },

    #[error("task '{task_id}' failed: {message}")]
    Execution { task_id: String, message: String },
}

impl TaskError {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Timeout { task_id, .. } | Self::Execution { task_id, .. } => task_id,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A unit of work for the parallel executor.
///
/// # Example
///
/// ```
/// use dbflow::execution::ParallelTask;
/// use serde_json::json;
/// use std::time::Duration;
///
/// let task = ParallelTask::new("count_users", || async { Ok(json!(42)) })
///     .with_priority(10)
///     .with_timeout(Duration::from_secs(5));
/// assert_eq!(task.priority(), 10);
/// ```
pub struct ParallelTask {
    id: String,
    priority: i32,
    timeout: Option<Duration>,
    metadata: HashMap<String, String>,
    body: TaskBody,
}

impl ParallelTask {
    /// Creates a task with priority 0 and no timeout of its own.
    pub fn new<F, Fut>(id: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        Self {
            id: id.into(),
            priority: 0,
            timeout: None,
            metadata: HashMap::new(),
            body: Box::new(move || work().boxed()),
        }
    }

    /// Higher priorities are dispatched first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub(crate) fn into_parts(self) -> (String, Option<Duration>, TaskBody) {
        (self.id, self.timeout, self.body)
    }
}

impl fmt::Debug for ParallelTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelTask")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Outcome of one dispatched task.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    task_id: String,
    outcome: Result<Value, TaskError>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub(crate) fn new(
        task_id: String,
        outcome: Result<Value, TaskError>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            outcome,
            started_at,
            finished_at,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn output(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    /// Wall-clock time between start and finish.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn into_output(self) -> Result<Value, TaskError> {
        self.outcome
    }
}
