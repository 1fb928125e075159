//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing,
//! validating and checkpointing phased agent workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowStep, WorkflowSpec, Phase)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Validation rules and dependency checking
//! - [`planner`]: Per-run step tracking and ready-set computation
//! - [`context`]: Shared context threaded between steps
//! - [`state`]: Checkpoint stores

pub mod context;
pub mod error;
pub mod model;
pub mod parser;
pub mod planner;
pub mod state;
pub mod validator;

pub use context::WorkflowContext;
pub use error::WorkflowError;
pub use model::{
    AgentKind, OperationSpec, Phase, RetryPolicy, StepCondition, StepStatus, WorkflowRunStatus,
    WorkflowSpec, WorkflowStep,
};
pub use parser::{load_workflow, parse_workflow, save_workflow};
pub use planner::{ExecutionPlanner, StepCounts, StepRecord};
pub use state::{
    CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, StepSnapshot,
    WorkflowCheckpoint,
};
pub use validator::{validate_workflow, ValidationError};
