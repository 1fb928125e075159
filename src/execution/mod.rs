//! Workflow Execution Module
//!
//! Provides bounded parallel execution of tasks and the orchestrator that
//! drives phased workflows on top of it.
//!
//! # Architecture
//!
//! - [`executor`]: Priority-ordered, concurrency-capped batch runner
//! - [`task`]: Units of work and their results
//! - [`aggregation`]: Batch success rules (ALL, FIRST, MAJORITY, THRESHOLD)
//! - [`agents`]: Agent trait, registry and built-in agents
//! - [`step`]: Single step execution with safety gating and retries
//! - [`orchestrator`]: Phase-by-phase workflow execution

pub mod agents;
pub mod aggregation;
pub mod executor;
pub mod orchestrator;
pub mod step;
pub mod task;

pub use agents::{
    Agent, AgentInvocation, AgentRegistry, AgentResult, CommandAgent, FnAgent, StaticAgent,
};
pub use aggregation::{AggregatedResult, AggregationStrategy};
pub use executor::{ExecutorError, ParallelExecutor};
pub use orchestrator::{
    Orchestrator, PhaseNode, StepNode, StepReport, WorkflowGraph, WorkflowOutcome, WorkflowStatus,
};
pub use task::{ExecutionResult, ParallelTask, TaskError, TaskOutput};
