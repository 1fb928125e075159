//! Execution Planner
//!
//! Tracks per-step state for one workflow run:
//! - Dependency resolution and ready-set computation per phase
//! - Step status transitions and attempt counts
//! - Step timing
//!
//! The orchestrator is the only caller that mutates a planner.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use log::{debug, info};

use super::error::WorkflowError;
use super::model::{Phase, StepStatus, WorkflowSpec, WorkflowStep};
use super::state::{StepSnapshot, WorkflowCheckpoint};
use super::validator::compute_ancestors;

/// Runtime record for a single step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub status: StepStatus,
    /// Attempts started so far
    pub attempts: u32,
    /// True for optional steps skipped after exhausting their retries
    pub skipped_on_failure: bool,
    /// Last error, or why the step was skipped
    pub error: Option<String>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl StepRecord {
    fn new() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            skipped_on_failure: false,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Duration in milliseconds, once the step has finished.
    pub fn duration_ms(&self) -> Option<u128> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end.duration_since(start).as_millis()),
            _ => None,
        }
    }
}

/// Step totals by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub running: usize,
    pub pending: usize,
}

/// Manages step scheduling for a workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    /// The workflow being executed (validated, topologically ordered)
    spec: WorkflowSpec,
    records: BTreeMap<String, StepRecord>,
    ancestors: HashMap<String, HashSet<String>>,
}

impl ExecutionPlanner {
    /// Creates a planner with every step pending.
    pub fn new(spec: WorkflowSpec) -> Self {
        let records = spec
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepRecord::new()))
            .collect();
        let ancestors = compute_ancestors(&spec.steps);

        info!(
            "Creating planner for '{}': {} steps",
            spec.name,
            spec.steps.len()
        );

        Self {
            spec,
            records,
            ancestors,
        }
    }

    /// Creates a planner that resumes from a checkpoint.
    ///
    /// Statuses and attempt counts of steps known to the checkpoint are
    /// restored; steps added since then start pending.
    pub fn from_checkpoint(spec: WorkflowSpec, checkpoint: &WorkflowCheckpoint) -> Self {
        let mut planner = Self::new(spec);

        for (step_id, snapshot) in &checkpoint.steps {
            if let Some(record) = planner.records.get_mut(step_id) {
                // A step caught mid-flight runs again
                record.status = match snapshot.status {
                    StepStatus::Running => StepStatus::Pending,
                    status => status,
                };
                record.attempts = snapshot.attempts;
                if record.status.is_terminal() {
                    info!("Restored step '{}' as {}", step_id, record.status);
                }
            }
        }

        planner
    }

    pub fn spec(&self) -> &WorkflowSpec {
        &self.spec
    }

    pub fn record(&self, step_id: &str) -> Option<&StepRecord> {
        self.records.get(step_id)
    }

    pub fn records(&self) -> &BTreeMap<String, StepRecord> {
        &self.records
    }

    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.records.get(step_id).map(|r| r.status)
    }

    /// Transitive dependencies of a step.
    pub fn ancestors(&self, step_id: &str) -> HashSet<String> {
        self.ancestors.get(step_id).cloned().unwrap_or_default()
    }

    /// Pending steps of a phase whose dependencies all succeeded or were
    /// skipped, in topological order.
    pub fn ready_steps(&self, phase: Phase) -> Vec<WorkflowStep> {
        self.spec
            .steps_in(phase)
            .filter(|s| self.status(&s.id) == Some(StepStatus::Pending))
            .filter(|s| self.dependencies_satisfied(s))
            .cloned()
            .collect()
    }

    /// First pending step of a phase that waits on an unsatisfied
    /// dependency, with that dependency and its status.
    pub fn blocked_dependency(&self, phase: Phase) -> Option<(String, String, StepStatus)> {
        self.spec
            .steps_in(phase)
            .filter(|s| self.status(&s.id) == Some(StepStatus::Pending))
            .find_map(|s| {
                s.depends_on.iter().find_map(|dep| {
                    let status = self.status(dep).unwrap_or(StepStatus::Pending);
                    (!status.satisfies_dependency()).then(|| (s.id.clone(), dep.clone(), status))
                })
            })
    }

    /// Fails unless every dependency of the step succeeded or was skipped.
    pub fn ensure_dependencies(&self, step_id: &str) -> Result<(), WorkflowError> {
        let Some(step) = self.spec.get_step(step_id) else {
            return Ok(());
        };
        for dep in &step.depends_on {
            let status = self.status(dep).unwrap_or(StepStatus::Pending);
            if !status.satisfies_dependency() {
                return Err(WorkflowError::DependencyNotSatisfied {
                    step: step_id.to_string(),
                    dependency: dep.clone(),
                    status,
                });
            }
        }
        Ok(())
    }

    fn dependencies_satisfied(&self, step: &WorkflowStep) -> bool {
        step.depends_on.iter().all(|dep| {
            self.status(dep)
                .map_or(false, |status| status.satisfies_dependency())
        })
    }

    /// True when every step of the phase is terminal.
    pub fn phase_complete(&self, phase: Phase) -> bool {
        self.spec
            .steps_in(phase)
            .all(|s| self.status(&s.id).map_or(false, |st| st.is_terminal()))
    }

    /// Marks a step as running.
    pub fn mark_running(&mut self, step_id: &str) {
        if let Some(record) = self.records.get_mut(step_id) {
            record.status = StepStatus::Running;
            record.started_at = Some(Instant::now());
            debug!("Step '{}' running", step_id);
        }
    }

    /// Counts a new attempt and returns its number.
    pub fn record_attempt(&mut self, step_id: &str) -> u32 {
        match self.records.get_mut(step_id) {
            Some(record) => {
                record.attempts += 1;
                record.attempts
            }
            None => 0,
        }
    }

    /// Marks a step as succeeded.
    pub fn mark_succeeded(&mut self, step_id: &str) {
        self.finish(step_id, StepStatus::Succeeded, None);
    }

    /// Marks a step as failed.
    pub fn mark_failed(&mut self, step_id: &str, error: String) {
        self.finish(step_id, StepStatus::Failed, Some(error));
    }

    /// Marks a step as skipped. `on_failure` records an optional step that
    /// exhausted its retries.
    pub fn mark_skipped(&mut self, step_id: &str, on_failure: bool, reason: Option<String>) {
        self.finish(step_id, StepStatus::Skipped, reason);
        if let Some(record) = self.records.get_mut(step_id) {
            record.skipped_on_failure = on_failure;
        }
    }

    fn finish(&mut self, step_id: &str, status: StepStatus, error: Option<String>) {
        if let Some(record) = self.records.get_mut(step_id) {
            record.status = status;
            record.error = error;
            record.finished_at = Some(Instant::now());
            debug!("Step '{}' {}", step_id, status);
        }
    }

    /// Returns step totals by status.
    pub fn counts(&self) -> StepCounts {
        let mut counts = StepCounts::default();
        for record in self.records.values() {
            match record.status {
                StepStatus::Succeeded => counts.succeeded += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Skipped => counts.skipped += 1,
                StepStatus::Running => counts.running += 1,
                StepStatus::Pending => counts.pending += 1,
            }
        }
        counts
    }

    /// Step statuses as stored in a checkpoint.
    pub fn snapshot(&self) -> BTreeMap<String, StepSnapshot> {
        self.records
            .iter()
            .map(|(id, r)| {
                (
                    id.clone(),
                    StepSnapshot {
                        status: r.status,
                        attempts: r.attempts,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::WorkflowContext;
    use crate::workflow::model::AgentKind;
    use chrono::Utc;

    fn create_test_spec() -> WorkflowSpec {
        WorkflowSpec::new("test")
            .with_step(WorkflowStep::new("step1", Phase::Specification, AgentKind::Research))
            .with_step(
                WorkflowStep::new("step2", Phase::Specification, AgentKind::Analysis)
                    .depends_on("step1"),
            )
            .with_step(
                WorkflowStep::new("step3", Phase::Architecture, AgentKind::Analysis)
                    .depends_on("step2"),
            )
    }

    fn ids(steps: &[WorkflowStep]) -> Vec<&str> {
        steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_planner_creation() {
        let planner = ExecutionPlanner::new(create_test_spec());
        assert_eq!(planner.counts().pending, 3);
        assert_eq!(planner.status("step1"), Some(StepStatus::Pending));
        assert!(planner.ancestors("step3").contains("step1"));
    }

    #[test]
    fn test_ready_steps_follow_dependencies() {
        let mut planner = ExecutionPlanner::new(create_test_spec());
        assert_eq!(ids(&planner.ready_steps(Phase::Specification)), vec!["step1"]);
        assert!(planner.ready_steps(Phase::Architecture).is_empty());

        planner.mark_running("step1");
        assert!(planner.ready_steps(Phase::Specification).is_empty());

        planner.mark_succeeded("step1");
        assert_eq!(ids(&planner.ready_steps(Phase::Specification)), vec!["step2"]);
    }

    #[test]
    fn test_skipped_dependency_unblocks() {
        let mut planner = ExecutionPlanner::new(create_test_spec());
        planner.mark_skipped("step1", false, Some("condition unmet".to_string()));
        assert_eq!(ids(&planner.ready_steps(Phase::Specification)), vec!["step2"]);
        assert!(planner.ensure_dependencies("step2").is_ok());
    }

    #[test]
    fn test_failed_dependency_blocks() {
        let mut planner = ExecutionPlanner::new(create_test_spec());
        planner.mark_running("step1");
        planner.mark_failed("step1", "boom".to_string());

        assert!(planner.ready_steps(Phase::Specification).is_empty());
        assert_eq!(
            planner.blocked_dependency(Phase::Specification),
            Some(("step2".to_string(), "step1".to_string(), StepStatus::Failed))
        );
        assert!(matches!(
            planner.ensure_dependencies("step2"),
            Err(WorkflowError::DependencyNotSatisfied { .. })
        ));
        assert_eq!(planner.record("step1").unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_phase_complete() {
        let mut planner = ExecutionPlanner::new(create_test_spec());
        assert!(!planner.phase_complete(Phase::Specification));
        assert!(planner.phase_complete(Phase::Completion));

        planner.mark_succeeded("step1");
        planner.mark_skipped("step2", true, Some("retries exhausted".to_string()));
        assert!(planner.phase_complete(Phase::Specification));
        assert!(planner.record("step2").unwrap().skipped_on_failure);
    }

    #[test]
    fn test_attempts_and_timing() {
        let mut planner = ExecutionPlanner::new(create_test_spec());
        planner.mark_running("step1");
        assert_eq!(planner.record_attempt("step1"), 1);
        assert_eq!(planner.record_attempt("step1"), 2);
        std::thread::sleep(std::time::Duration::from_millis(10));
        planner.mark_succeeded("step1");

        let record = planner.record("step1").unwrap();
        assert_eq!(record.attempts, 2);
        assert!(record.duration_ms().unwrap() >= 10);
    }

    #[test]
    fn test_planner_from_checkpoint() {
        let mut planner = ExecutionPlanner::new(create_test_spec());
        planner.mark_succeeded("step1");
        planner.record_attempt("step2");
        planner.mark_succeeded("step2");

        let checkpoint = WorkflowCheckpoint {
            workflow_id: "wf".to_string(),
            phase: Phase::Specification,
            steps: planner.snapshot(),
            context: WorkflowContext::new(),
            saved_at: Utc::now(),
        };

        let resumed = ExecutionPlanner::from_checkpoint(create_test_spec(), &checkpoint);
        assert_eq!(resumed.status("step2"), Some(StepStatus::Succeeded));
        assert_eq!(resumed.record("step2").unwrap().attempts, 1);
        assert_eq!(ids(&resumed.ready_steps(Phase::Architecture)), vec!["step3"]);
        assert_eq!(resumed.counts().succeeded, 2);
    }
}
