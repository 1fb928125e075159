//! Result Aggregation
//!
//! Strategies deciding when a batch of parallel tasks counts as successful.

use std::fmt;

use super::task::ExecutionResult;

/// How the results of a batch are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationStrategy {
    /// Every task must succeed
    All,
    /// Done as soon as any task succeeds
    First,
    /// More than half of the tasks must succeed
    Majority,
    /// At least `n` tasks must succeed
    Threshold(usize),
}

impl AggregationStrategy {
    /// Whether `succeeded` successes out of `total` tasks satisfy the strategy.
    pub fn is_satisfied(&self, succeeded: usize, total: usize) -> bool {
        match self {
            Self::All => succeeded == total,
            Self::First => succeeded >= 1,
            Self::Majority => succeeded * 2 > total,
            Self::Threshold(n) => succeeded >= *n,
        }
    }
}

impl fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "ALL"),
            Self::First => write!(f, "FIRST"),
            Self::Majority => write!(f, "MAJORITY"),
            Self::Threshold(n) => write!(f, "THRESHOLD({})", n),
        }
    }
}

/// Combined outcome of a batch.
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    pub strategy: AggregationStrategy,
    /// Number of tasks submitted
    pub total: usize,
    /// Whether the strategy was satisfied
    pub success: bool,
    /// Results received before the batch returned, in completion order
    pub results: Vec<ExecutionResult>,
    /// Id of the first task that succeeded
    pub first_success: Option<String>,
}

impl AggregatedResult {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn result(&self, task_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.task_id() == task_id)
    }
}
