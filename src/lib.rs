//! DbFlow - Agentic Workflow Execution Core
//!
//! Runs phased agent workflows for database operations: steps execute in
//! parallel under a concurrency cap, risky operations pass through an
//! approval gate, and every gating decision lands in a hash-chained audit
//! log.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Workflow definitions, parsing, validation and checkpoints
//! - [`execution`]: Parallel executor, agents and the phase orchestrator
//! - [`safety`]: Risk assessment, approvals and audit log
//! - [`monitoring`]: Execution timeline
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use dbflow::execution::{AgentRegistry, Orchestrator};
//! use dbflow::safety::{SafetyController, SafetyPolicy};
//! use dbflow::load_workflow;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow("migration.yaml")?;
//!
//!     // Create the orchestrator
//!     let safety = Arc::new(SafetyController::new(SafetyPolicy::default())?);
//!     let mut orchestrator = Orchestrator::new(Arc::new(AgentRegistry::with_defaults()), safety);
//!     orchestrator.set_max_parallel(4);
//!
//!     // Execute the workflow
//!     let outcome = orchestrator.run_spec(workflow, HashMap::new()).await?;
//!     println!("{}", outcome.status);
//!     Ok(())
//! }
//! ```

pub mod execution;
pub mod monitoring;
pub mod safety;
pub mod workflow;

// Re-export commonly used types
pub use execution::{Orchestrator, ParallelExecutor, WorkflowOutcome};
pub use safety::SafetyController;
pub use workflow::model::{Phase, WorkflowSpec, WorkflowStep};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "DbFlow";
