//! Workflow Errors

use thiserror::Error;

use super::model::StepStatus;
use super::state::CheckpointError;
use super::validator::ValidationError;
use crate::execution::ExecutorError;

/// Workflow-level failures. A run that hits one of these is marked FAILED
/// and the error is reported in its outcome.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("step '{step}' cannot run: dependency '{dependency}' is {status}")]
    DependencyNotSatisfied {
        step: String,
        dependency: String,
        status: StepStatus,
    },

    #[error("invalid workflow:\n{}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    #[error("context key '{key}' written by both '{first}' and '{second}' in the same phase")]
    ContextConflict {
        key: String,
        first: String,
        second: String,
    },

    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("no agent registered for '{0}'")]
    UnknownAgent(String),

    #[error("workflow '{0}' is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("failed to load workflow '{path}': {message}")]
    Load { path: String, message: String },

    #[error("no checkpoint found for workflow '{0}'")]
    NoCheckpoint(String),

    #[error("resume needs a workflow id")]
    MissingWorkflowId,
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
