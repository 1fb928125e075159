//! Execution Monitoring Module
//!
//! Provides the execution timeline recorded during workflow runs.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step start/retry/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
