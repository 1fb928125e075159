//! Workflow Orchestrator
//!
//! Drives workflows through their phases:
//! - Phases run strictly in order; empty phases are passed through
//! - Within a phase, each wave of ready steps is one executor batch
//! - Run conditions, retries and safety gating per step
//! - Declared outputs merged into the shared context
//! - A checkpoint after every completed phase, and resume from it
//!
//! The orchestrator is the only component that changes workflow and step
//! status.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;
use uuid::Uuid;

use super::agents::AgentRegistry;
use super::aggregation::{AggregatedResult, AggregationStrategy};
use super::executor::{ExecutorError, ParallelExecutor};
use super::step::{lock, StepRunner};
use super::task::{ParallelTask, TaskError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::safety::{AuditEntry, AuditFilter, OperationCategory, SafetyController};
use crate::workflow::{
    validate_workflow, AgentKind, CheckpointStore, ExecutionPlanner, MemoryCheckpointStore, Phase,
    StepCounts, StepStatus, WorkflowCheckpoint, WorkflowContext, WorkflowError,
    WorkflowRunStatus, WorkflowSpec,
};

/// Mutable bookkeeping of one run.
#[derive(Debug, Clone)]
struct RunMeta {
    status: WorkflowRunStatus,
    /// Phase the next run starts with, `None` when nothing is left
    start_phase: Option<Phase>,
    current_phase: Option<Phase>,
    last_checkpoint: Option<Phase>,
    completed_phases: Vec<Phase>,
    failed_step: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

struct WorkflowRun {
    id: String,
    planner: Arc<Mutex<ExecutionPlanner>>,
    timeline: Arc<Mutex<ExecutionTimeline>>,
    context: Mutex<WorkflowContext>,
    meta: Mutex<RunMeta>,
}

impl WorkflowRun {
    fn new(id: String, planner: ExecutionPlanner, context: WorkflowContext) -> Self {
        Self {
            id,
            planner: Arc::new(Mutex::new(planner)),
            timeline: Arc::new(Mutex::new(ExecutionTimeline::new())),
            context: Mutex::new(context),
            meta: Mutex::new(RunMeta {
                status: WorkflowRunStatus::Pending,
                start_phase: Some(Phase::Specification),
                current_phase: None,
                last_checkpoint: None,
                completed_phases: Vec::new(),
                failed_step: None,
                error: None,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            }),
        }
    }

    /// Marks the run as running and returns the phase to start with.
    ///
    /// A finished run starts over from scratch. Seed values never replace
    /// context restored from a checkpoint.
    fn begin(&self, seed: HashMap<String, Value>) -> Result<Option<Phase>, WorkflowError> {
        let mut meta = lock(&self.meta);
        match meta.status {
            WorkflowRunStatus::Running => return Err(WorkflowError::AlreadyRunning(self.id.clone())),
            WorkflowRunStatus::Succeeded | WorkflowRunStatus::Failed => {
                info!("Restarting workflow '{}' from the first phase", self.id);
                let mut planner = lock(&self.planner);
                let spec = planner.spec().clone();
                *planner = ExecutionPlanner::new(spec);
                *lock(&self.timeline) = ExecutionTimeline::new();
                *lock(&self.context) = WorkflowContext::new();
                meta.start_phase = Some(Phase::Specification);
                meta.last_checkpoint = None;
                meta.completed_phases.clear();
            }
            WorkflowRunStatus::Pending => {}
        }

        let mut context = lock(&self.context);
        for (key, value) in seed {
            if !context.contains(&key) {
                context.insert(key, value);
            }
        }

        meta.status = WorkflowRunStatus::Running;
        meta.current_phase = None;
        meta.failed_step = None;
        meta.error = None;
        meta.started_at = Some(Utc::now());
        meta.finished_at = None;
        Ok(meta.start_phase)
    }
}

/// Status of one step as reported by [`Orchestrator::get_status`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub phase: Phase,
    pub agent: AgentKind,
    pub status: StepStatus,
    pub attempts: u32,
    pub skipped_on_failure: bool,
    pub error: Option<String>,
    pub duration_ms: Option<u128>,
}

/// Point-in-time view of a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStatus {
    pub workflow_id: String,
    pub name: String,
    pub status: WorkflowRunStatus,
    pub current_phase: Option<Phase>,
    pub last_checkpoint: Option<Phase>,
    pub completed_phases: Vec<Phase>,
    pub steps: BTreeMap<String, StepReport>,
    pub context: WorkflowContext,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of running (or resuming) a workflow.
#[derive(Debug)]
pub struct WorkflowOutcome {
    pub workflow_id: String,
    pub status: WorkflowRunStatus,
    pub counts: StepCounts,
    /// Non-empty phases that completed, including ones restored on resume
    pub completed_phases: Vec<Phase>,
    pub failed_step: Option<String>,
    pub error: Option<WorkflowError>,
    pub context: WorkflowContext,
    pub elapsed: Duration,
}

impl WorkflowOutcome {
    pub fn is_success(&self) -> bool {
        self.status == WorkflowRunStatus::Succeeded
    }
}

/// A step as drawn by [`WorkflowGraph`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepNode {
    pub id: String,
    pub agent: AgentKind,
    pub status: StepStatus,
    pub depends_on: Vec<String>,
    pub optional: bool,
    pub condition: Option<String>,
    pub operation: Option<OperationCategory>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseNode {
    pub phase: Phase,
    pub steps: Vec<StepNode>,
}

/// Structure of a workflow with current step statuses.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowGraph {
    pub workflow_id: String,
    pub name: String,
    /// Every phase in order, including empty ones
    pub phases: Vec<PhaseNode>,
}

impl WorkflowGraph {
    fn from_planner(workflow_id: &str, planner: &ExecutionPlanner) -> Self {
        let spec = planner.spec();
        let phases = Phase::ALL
            .iter()
            .map(|&phase| PhaseNode {
                phase,
                steps: spec
                    .steps_in(phase)
                    .map(|s| StepNode {
                        id: s.id.clone(),
                        agent: s.agent,
                        status: planner.status(&s.id).unwrap_or(StepStatus::Pending),
                        depends_on: s.depends_on.clone(),
                        optional: s.optional,
                        condition: s.condition.as_ref().map(ToString::to_string),
                        operation: s.operation.as_ref().map(|op| op.category),
                    })
                    .collect(),
            })
            .collect();

        Self {
            workflow_id: workflow_id.to_string(),
            name: spec.name.clone(),
            phases,
        }
    }

    /// Number of steps across all phases.
    pub fn step_count(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }
}

impl fmt::Display for WorkflowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Workflow: {} [{}]", self.name, self.workflow_id)?;
        for node in &self.phases {
            writeln!(f, "{}", node.phase)?;
            if node.steps.is_empty() {
                writeln!(f, "  (no steps)")?;
                continue;
            }
            for step in &node.steps {
                write!(f, "  [{:<9}] {} ({})", step.status, step.id, step.agent)?;
                if step.optional {
                    write!(f, " optional")?;
                }
                if let Some(category) = step.operation {
                    write!(f, " !{}", category)?;
                }
                if let Some(condition) = &step.condition {
                    write!(f, " if {}", condition)?;
                }
                if !step.depends_on.is_empty() {
                    write!(f, " <- {}", step.depends_on.join(", "))?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Step a workflow error is attributed to.
fn failing_step(error: &WorkflowError) -> Option<String> {
    match error {
        WorkflowError::StepFailed { step, .. } => Some(step.clone()),
        WorkflowError::ContextConflict { second, .. } => Some(second.clone()),
        WorkflowError::DependencyNotSatisfied { step, .. } => Some(step.clone()),
        _ => None,
    }
}

/// Runs phased workflows on top of the parallel executor and safety gate.
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::HashMap;
/// use std::sync::Arc;
/// use dbflow::execution::{AgentRegistry, Orchestrator};
/// use dbflow::safety::{SafetyController, SafetyPolicy};
/// use dbflow::workflow::load_workflow;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let safety = Arc::new(SafetyController::new(SafetyPolicy::default())?);
///     let mut orchestrator = Orchestrator::new(Arc::new(AgentRegistry::with_defaults()), safety);
///     orchestrator.set_max_parallel(4);
///
///     let outcome = orchestrator
///         .run_spec(load_workflow("migration.yaml")?, HashMap::new())
///         .await?;
///     println!("{} in {:.2?}", outcome.status, outcome.elapsed);
///     Ok(())
/// }
/// ```
pub struct Orchestrator {
    agents: Arc<AgentRegistry>,
    safety: Arc<SafetyController>,
    executor: ParallelExecutor,
    max_parallel: usize,
    checkpoints: Arc<dyn CheckpointStore>,
    runs: RwLock<HashMap<String, Arc<WorkflowRun>>>,
}

impl Orchestrator {
    /// Creates an orchestrator with one slot per CPU and in-memory
    /// checkpoints.
    pub fn new(agents: Arc<AgentRegistry>, safety: Arc<SafetyController>) -> Self {
        Self {
            agents,
            safety,
            executor: ParallelExecutor::new(),
            max_parallel: num_cpus::get().max(1),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Sets the maximum number of steps running at once.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = max.max(1);
    }

    /// Sets where phase checkpoints are saved and loaded.
    pub fn set_checkpoint_store(&mut self, store: Arc<dyn CheckpointStore>) {
        self.checkpoints = store;
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn safety(&self) -> &Arc<SafetyController> {
        &self.safety
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    /// Validates and registers a workflow, returning its id.
    ///
    /// The spec's own id is used when present, otherwise one is generated.
    pub fn submit_workflow(&self, spec: WorkflowSpec) -> Result<String, WorkflowError> {
        let spec = self.prepare(spec)?;
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let spec = WorkflowSpec {
            id: Some(id.clone()),
            ..spec
        };

        info!("Submitted workflow '{}' as {} ({} steps)", spec.name, id, spec.len());
        let run = WorkflowRun::new(id.clone(), ExecutionPlanner::new(spec), WorkflowContext::new());
        self.insert_run(run)?;
        Ok(id)
    }

    /// Runs a submitted workflow with the given initial context.
    ///
    /// Step failures, denials and checkpoint errors do not return `Err`;
    /// they mark the workflow FAILED and are reported in the outcome.
    pub async fn run(
        &self,
        workflow_id: &str,
        context: HashMap<String, Value>,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let run = self.get_run(workflow_id)?;
        let start = run.begin(context)?;
        Ok(self.drive(&run, start).await)
    }

    /// Submits and runs a workflow.
    pub async fn run_spec(
        &self,
        spec: WorkflowSpec,
        context: HashMap<String, Value>,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let id = self.submit_workflow(spec)?;
        self.run(&id, context).await
    }

    /// Continues a workflow from its latest checkpoint.
    ///
    /// Step statuses and context are restored and execution continues with
    /// the phase after the checkpointed one. Seed values only fill keys the
    /// checkpoint does not hold.
    pub async fn resume(
        &self,
        spec: WorkflowSpec,
        seed: HashMap<String, Value>,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let id = spec.id.clone().ok_or(WorkflowError::MissingWorkflowId)?;
        let spec = self.prepare(spec)?;

        let checkpoint: WorkflowCheckpoint = self
            .checkpoints
            .load(&id)?
            .ok_or_else(|| WorkflowError::NoCheckpoint(id.clone()))?;

        info!(
            "Resuming workflow '{}' after {} ({} context keys)",
            id,
            checkpoint.phase,
            checkpoint.context.len()
        );

        let planner = ExecutionPlanner::from_checkpoint(spec, &checkpoint);
        let completed: Vec<Phase> = Phase::ALL
            .iter()
            .copied()
            .filter(|p| *p <= checkpoint.phase && planner.spec().steps_in(*p).next().is_some())
            .collect();

        let run = WorkflowRun::new(id, planner, checkpoint.context.clone());
        {
            let mut meta = lock(&run.meta);
            meta.start_phase = checkpoint.resume_phase();
            meta.last_checkpoint = Some(checkpoint.phase);
            meta.completed_phases = completed;
        }

        let run = self.insert_run(run)?;
        let start = run.begin(seed)?;
        Ok(self.drive(&run, start).await)
    }

    /// Returns a snapshot of a workflow's state.
    pub fn get_status(&self, workflow_id: &str) -> Result<WorkflowStatus, WorkflowError> {
        let run = self.get_run(workflow_id)?;

        let (name, steps) = {
            let planner = lock(&run.planner);
            let steps = planner
                .spec()
                .steps
                .iter()
                .filter_map(|s| {
                    planner.record(&s.id).map(|r| {
                        (
                            s.id.clone(),
                            StepReport {
                                phase: s.phase,
                                agent: s.agent,
                                status: r.status,
                                attempts: r.attempts,
                                skipped_on_failure: r.skipped_on_failure,
                                error: r.error.clone(),
                                duration_ms: r.duration_ms(),
                            },
                        )
                    })
                })
                .collect();
            (planner.spec().name.clone(), steps)
        };
        let context = lock(&run.context).clone();
        let meta = lock(&run.meta).clone();

        Ok(WorkflowStatus {
            workflow_id: run.id.clone(),
            name,
            status: meta.status,
            current_phase: meta.current_phase,
            last_checkpoint: meta.last_checkpoint,
            completed_phases: meta.completed_phases,
            steps,
            context,
            failed_step: meta.failed_step,
            error: meta.error,
            created_at: meta.created_at,
            started_at: meta.started_at,
            finished_at: meta.finished_at,
        })
    }

    /// Returns the workflow structure with current step statuses.
    pub fn visualize(&self, workflow_id: &str) -> Result<WorkflowGraph, WorkflowError> {
        let run = self.get_run(workflow_id)?;
        let planner = lock(&run.planner);
        Ok(WorkflowGraph::from_planner(&run.id, &planner))
    }

    /// Returns the timeline of the workflow's latest run.
    pub fn timeline(&self, workflow_id: &str) -> Result<ExecutionTimeline, WorkflowError> {
        let run = self.get_run(workflow_id)?;
        let timeline = lock(&run.timeline).clone();
        Ok(timeline)
    }

    /// Runs an ad-hoc batch on the executor with this orchestrator's
    /// parallelism.
    pub async fn run_parallel(
        &self,
        tasks: Vec<ParallelTask>,
        strategy: AggregationStrategy,
    ) -> Result<AggregatedResult, ExecutorError> {
        self.executor.submit(tasks, strategy, self.max_parallel).await
    }

    /// Queries the safety controller's audit log.
    pub fn query_audit_log(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.safety.query_audit_log(filter)
    }

    /// Validates a spec and checks every step has an agent.
    fn prepare(&self, mut spec: WorkflowSpec) -> Result<WorkflowSpec, WorkflowError> {
        validate_workflow(&mut spec)?;
        if let Some(step) = spec.steps.iter().find(|s| !self.agents.contains(s.agent)) {
            return Err(WorkflowError::UnknownAgent(step.agent.to_string()));
        }
        Ok(spec)
    }

    fn insert_run(&self, run: WorkflowRun) -> Result<Arc<WorkflowRun>, WorkflowError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = runs.get(&run.id) {
            if lock(&existing.meta).status == WorkflowRunStatus::Running {
                return Err(WorkflowError::AlreadyRunning(run.id.clone()));
            }
        }
        let run = Arc::new(run);
        runs.insert(run.id.clone(), Arc::clone(&run));
        Ok(run)
    }

    fn get_run(&self, workflow_id: &str) -> Result<Arc<WorkflowRun>, WorkflowError> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))
    }

    async fn drive(&self, run: &Arc<WorkflowRun>, start: Option<Phase>) -> WorkflowOutcome {
        let started = Instant::now();
        info!(
            "Starting workflow '{}' (max parallel: {}, from {})",
            run.id,
            self.max_parallel,
            start.map_or("completion".to_string(), |p| p.to_string())
        );

        let phases: Vec<Phase> = match start {
            Some(start) => Phase::ALL.iter().copied().filter(|p| *p >= start).collect(),
            None => Vec::new(),
        };

        let mut failure = None;
        for phase in phases {
            lock(&run.meta).current_phase = Some(phase);

            let empty = lock(&run.planner).spec().steps_in(phase).next().is_none();
            if empty {
                debug!("Phase {} has no steps", phase);
                continue;
            }

            info!("Entering phase {}", phase);
            if let Err(e) = self.run_phase(run, phase).await {
                error!("Phase {} aborted: {}", phase, e);
                failure = Some(e);
                break;
            }
            lock(&run.meta).completed_phases.push(phase);

            if let Err(e) = self.save_checkpoint(run, phase) {
                error!("Checkpoint after {} failed: {}", phase, e);
                failure = Some(e);
                break;
            }
        }

        self.finish(run, failure, started.elapsed())
    }

    /// Runs waves of ready steps until every step of the phase is terminal.
    async fn run_phase(&self, run: &Arc<WorkflowRun>, phase: Phase) -> Result<(), WorkflowError> {
        let mut wave = 0;
        loop {
            let ready = lock(&run.planner).ready_steps(phase);

            if ready.is_empty() {
                let planner = lock(&run.planner);
                if planner.phase_complete(phase) {
                    info!("Phase {} completed", phase);
                    return Ok(());
                }
                return match planner.blocked_dependency(phase) {
                    Some((step, dependency, status)) => Err(WorkflowError::DependencyNotSatisfied {
                        step,
                        dependency,
                        status,
                    }),
                    None => Ok(()),
                };
            }

            wave += 1;
            let context = lock(&run.context).clone();
            let snapshot = context.to_map();
            let mut tasks = Vec::with_capacity(ready.len());

            for step in ready {
                if let Some(condition) = &step.condition {
                    if !condition.is_met(&context) {
                        info!("Skipping step '{}': condition {} not met", step.id, condition);
                        lock(&run.planner).mark_skipped(
                            &step.id,
                            false,
                            Some(format!("condition not met: {}", condition)),
                        );
                        lock(&run.timeline).add_event(step.id.as_str(), EventType::Skipped);
                        continue;
                    }
                }

                let agent = self
                    .agents
                    .get(step.agent)
                    .ok_or_else(|| WorkflowError::UnknownAgent(step.agent.to_string()))?;

                tasks.push(
                    StepRunner {
                        workflow_id: run.id.clone(),
                        step,
                        agent,
                        safety: Arc::clone(&self.safety),
                        planner: Arc::clone(&run.planner),
                        timeline: Arc::clone(&run.timeline),
                        context: snapshot.clone(),
                    }
                    .into_task(),
                );
            }

            if tasks.is_empty() {
                continue;
            }

            debug!("Phase {} wave {}: {} step(s)", phase, wave, tasks.len());
            let batch = self
                .executor
                .submit(tasks, AggregationStrategy::All, self.max_parallel)
                .await?;
            self.apply_results(run, phase, &batch)?;
        }
    }

    /// Records a batch's results: outputs into the context, then statuses.
    fn apply_results(
        &self,
        run: &WorkflowRun,
        phase: Phase,
        batch: &AggregatedResult,
    ) -> Result<(), WorkflowError> {
        let mut failure = None;

        for result in &batch.results {
            let step_id = result.task_id();

            if let Some(value) = result.output() {
                let outputs: Vec<(String, Value)> = value
                    .as_object()
                    .map(|fields| fields.clone().into_iter().collect())
                    .unwrap_or_default();
                let ancestors = lock(&run.planner).ancestors(step_id);
                let merged = lock(&run.context).merge_outputs(phase, step_id, &ancestors, outputs);

                match merged {
                    Ok(()) => lock(&run.planner).mark_succeeded(step_id),
                    Err(e) => {
                        lock(&run.planner).mark_failed(step_id, e.to_string());
                        lock(&run.timeline).add_event(step_id, EventType::Failed);
                        failure.get_or_insert(e);
                    }
                }
                continue;
            }

            let message = match result.error() {
                Some(TaskError::Execution { message, .. }) => message.clone(),
                Some(other) => other.to_string(),
                None => "no result".to_string(),
            };
            let optional = lock(&run.planner)
                .spec()
                .get_step(step_id)
                .map_or(false, |s| s.optional);

            if optional {
                warn!("Optional step '{}' skipped after failure: {}", step_id, message);
                lock(&run.planner).mark_skipped(step_id, true, Some(message));
                lock(&run.timeline).add_event(step_id, EventType::Skipped);
            } else {
                lock(&run.planner).mark_failed(step_id, message.clone());
                failure.get_or_insert(WorkflowError::StepFailed {
                    step: step_id.to_string(),
                    message,
                });
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn save_checkpoint(&self, run: &WorkflowRun, phase: Phase) -> Result<(), WorkflowError> {
        let checkpoint = WorkflowCheckpoint {
            workflow_id: run.id.clone(),
            phase,
            steps: lock(&run.planner).snapshot(),
            context: lock(&run.context).clone(),
            saved_at: Utc::now(),
        };
        self.checkpoints.save(&run.id, phase, &checkpoint)?;
        lock(&run.meta).last_checkpoint = Some(phase);
        Ok(())
    }

    fn finish(
        &self,
        run: &WorkflowRun,
        failure: Option<WorkflowError>,
        elapsed: Duration,
    ) -> WorkflowOutcome {
        let counts = lock(&run.planner).counts();
        let context = lock(&run.context).clone();
        let status = if failure.is_none() {
            WorkflowRunStatus::Succeeded
        } else {
            WorkflowRunStatus::Failed
        };
        let failed_step = failure.as_ref().and_then(failing_step);

        let completed_phases = {
            let mut meta = lock(&run.meta);
            meta.status = status;
            meta.failed_step = failed_step.clone();
            meta.error = failure.as_ref().map(ToString::to_string);
            meta.finished_at = Some(Utc::now());
            meta.completed_phases.clone()
        };

        match &failure {
            None => info!(
                "Workflow '{}' succeeded in {:.2?}: {} succeeded, {} skipped",
                run.id, elapsed, counts.succeeded, counts.skipped
            ),
            Some(e) => error!("Workflow '{}' failed after {:.2?}: {}", run.id, elapsed, e),
        }

        WorkflowOutcome {
            workflow_id: run.id.clone(),
            status,
            counts,
            completed_phases,
            failed_step,
            error: failure,
            context,
            elapsed,
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.agents)
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::agents::{AgentInvocation, FnAgent};
    use crate::safety::{AuditDecision, CallbackApproval, SafetyPolicy};
    use crate::workflow::{RetryPolicy, StepCondition, WorkflowStep};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn orchestrator(registry: AgentRegistry) -> Orchestrator {
        let safety = SafetyController::new(SafetyPolicy::default()).unwrap();
        let mut orchestrator = Orchestrator::new(Arc::new(registry), Arc::new(safety));
        orchestrator.set_max_parallel(4);
        orchestrator
    }

    fn counting_agent(calls: &Arc<AtomicU32>) -> FnAgent {
        let calls = Arc::clone(calls);
        FnAgent::new(move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(HashMap::new())
            }
        })
    }

    fn fullstack_spec() -> WorkflowSpec {
        WorkflowSpec::new("fullstack")
            .with_step(
                WorkflowStep::new("requirements", Phase::Specification, AgentKind::Research)
                    .with_params(json!({"result": {"api": "/v1"}}))
                    .with_output("api"),
            )
            .with_step(
                WorkflowStep::new("frontend", Phase::Architecture, AgentKind::CodeGeneration)
                    .depends_on("requirements")
                    .with_params(json!({"delay_ms": 200})),
            )
            .with_step(
                WorkflowStep::new("backend", Phase::Architecture, AgentKind::CodeGeneration)
                    .depends_on("requirements")
                    .with_params(json!({"delay_ms": 400})),
            )
            .with_step(
                WorkflowStep::new("integrate", Phase::Completion, AgentKind::Analysis)
                    .depends_on("frontend")
                    .depends_on("backend"),
            )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_phase_timing() {
        let orchestrator = orchestrator(AgentRegistry::with_defaults());
        let id = orchestrator.submit_workflow(fullstack_spec()).unwrap();

        let outcome = orchestrator.run(&id, HashMap::new()).await.unwrap();
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.counts.succeeded, 4);
        assert!(outcome.elapsed >= Duration::from_millis(400));
        assert!(outcome.elapsed < Duration::from_millis(580), "{:?}", outcome.elapsed);
        assert_eq!(
            outcome.completed_phases,
            vec![Phase::Specification, Phase::Architecture, Phase::Completion]
        );

        let timeline = orchestrator.timeline(&id).unwrap();
        let integrate = timeline.first_event("integrate", EventType::Started).unwrap();
        assert!(integrate >= timeline.finished_at("backend").unwrap());
        assert!(integrate >= timeline.finished_at("frontend").unwrap());
        assert!(
            timeline.first_event("frontend", EventType::Started).unwrap()
                < timeline.finished_at("requirements").unwrap() + Duration::from_millis(100)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dependency_order_within_phase() {
        let spec = WorkflowSpec::new("chain")
            .with_step(WorkflowStep::new("a", Phase::Refinement, AgentKind::Analysis)
                .with_params(json!({"delay_ms": 30})))
            .with_step(WorkflowStep::new("b", Phase::Refinement, AgentKind::Analysis).depends_on("a"))
            .with_step(WorkflowStep::new("c", Phase::Refinement, AgentKind::Analysis).depends_on("b"));
        let orchestrator = orchestrator(AgentRegistry::with_defaults());
        let id = orchestrator.submit_workflow(spec).unwrap();
        assert!(orchestrator.run(&id, HashMap::new()).await.unwrap().is_success());

        let timeline = orchestrator.timeline(&id).unwrap();
        let start = |s| timeline.first_event(s, EventType::Started).unwrap();
        assert!(start("b") >= timeline.finished_at("a").unwrap());
        assert!(start("c") >= timeline.finished_at("b").unwrap());
    }

    #[tokio::test]
    async fn test_retry_three_attempts() {
        let agent = FnAgent::new(|inv: AgentInvocation| async move {
            if inv.attempt < 3 {
                Err(format!("connection reset (attempt {})", inv.attempt).into())
            } else {
                Ok(HashMap::from([("version".to_string(), json!(42))]))
            }
        });
        let spec = WorkflowSpec::new("retry").with_step(
            WorkflowStep::new("migrate", Phase::Refinement, AgentKind::Analysis)
                .with_retry(RetryPolicy::new(3).with_backoff(Duration::from_millis(10), 2.0))
                .with_output("version"),
        );
        let orchestrator = orchestrator(AgentRegistry::new().with_agent(AgentKind::Analysis, agent));

        let outcome = orchestrator.run_spec(spec, HashMap::new()).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.context.get("version"), Some(&json!(42)));

        let status = orchestrator.get_status(&outcome.workflow_id).unwrap();
        assert_eq!(status.steps["migrate"].attempts, 3);
        assert_eq!(status.steps["migrate"].status, StepStatus::Succeeded);
        let timeline = orchestrator.timeline(&outcome.workflow_id).unwrap();
        assert_eq!(timeline.count("migrate", EventType::Retrying), 2);
    }

    #[tokio::test]
    async fn test_required_failure_aborts() {
        let memory = Arc::new(MemoryCheckpointStore::new());
        let spec = WorkflowSpec::new("abort")
            .with_id("abort")
            .with_step(
                WorkflowStep::new("research", Phase::Specification, AgentKind::Research)
                    .with_params(json!({"error": "catalog unavailable"}))
                    .with_retry(RetryPolicy::new(2)),
            )
            .with_step(WorkflowStep::new("report", Phase::Completion, AgentKind::Analysis));
        let mut orchestrator = orchestrator(AgentRegistry::with_defaults());
        orchestrator.set_checkpoint_store(memory.clone());

        let outcome = orchestrator.run_spec(spec, HashMap::new()).await.unwrap();
        assert_eq!(outcome.status, WorkflowRunStatus::Failed);
        assert_eq!(outcome.failed_step.as_deref(), Some("research"));
        assert!(matches!(outcome.error, Some(WorkflowError::StepFailed { .. })));
        assert_eq!(outcome.counts.failed, 1);
        assert_eq!(outcome.counts.pending, 1);
        assert!(outcome.completed_phases.is_empty());
        assert_eq!(memory.save_count("abort"), 0);

        let status = orchestrator.get_status("abort").unwrap();
        assert_eq!(status.steps["research"].attempts, 2);
        assert!(status.steps["research"]
            .error
            .as_deref()
            .unwrap()
            .contains("catalog unavailable"));
        assert_eq!(status.steps["report"].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_optional_failure_skips() {
        let spec = WorkflowSpec::new("optional")
            .with_step(
                WorkflowStep::new("lint", Phase::Refinement, AgentKind::Analysis)
                    .with_params(json!({"error": "linter missing"}))
                    .optional(),
            )
            .with_step(WorkflowStep::new("deploy", Phase::Refinement, AgentKind::Research).depends_on("lint"));
        let orchestrator = orchestrator(AgentRegistry::with_defaults());

        let outcome = orchestrator.run_spec(spec, HashMap::new()).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.counts.skipped, 1);
        assert_eq!(outcome.counts.succeeded, 1);

        let status = orchestrator.get_status(&outcome.workflow_id).unwrap();
        assert!(status.steps["lint"].skipped_on_failure);
        assert_eq!(status.steps["lint"].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_context_propagation_and_conditions() {
        let echo = FnAgent::new(|inv: AgentInvocation| async move {
            let env = inv.context.get("env").cloned().unwrap_or(Value::Null);
            let region = inv.context.get("region").cloned().unwrap_or(Value::Null);
            Ok(HashMap::from([("seen".to_string(), json!([env, region]))]))
        });
        let calls = Arc::new(AtomicU32::new(0));
        let registry = AgentRegistry::with_defaults()
            .with_agent(AgentKind::CodeGeneration, echo)
            .with_agent(AgentKind::Analysis, counting_agent(&calls));

        let spec = WorkflowSpec::new("context")
            .with_step(
                WorkflowStep::new("detect", Phase::Specification, AgentKind::Research)
                    .with_params(json!({"result": {"env": "staging"}}))
                    .with_output("env"),
            )
            .with_step(
                WorkflowStep::new("generate", Phase::Pseudocode, AgentKind::CodeGeneration)
                    .with_condition(StepCondition::ContextEquals {
                        key: "env".to_string(),
                        value: json!("staging"),
                    })
                    .with_output("seen"),
            )
            .with_step(
                WorkflowStep::new("bootstrap", Phase::Pseudocode, AgentKind::Analysis)
                    .with_condition(StepCondition::ContextMissing("env".to_string())),
            );
        let orchestrator = orchestrator(registry);

        let seed = HashMap::from([("region".to_string(), json!("eu-west-1"))]);
        let outcome = orchestrator.run_spec(spec, seed).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.context.get("seen"), Some(&json!(["staging", "eu-west-1"])));
        assert_eq!(outcome.context.writer("seen"), Some("generate"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let status = orchestrator.get_status(&outcome.workflow_id).unwrap();
        assert_eq!(status.steps["bootstrap"].status, StepStatus::Skipped);
        assert!(!status.steps["bootstrap"].skipped_on_failure);
    }

    #[tokio::test]
    async fn test_yaml_conditions_drive_execution() {
        let spec = crate::workflow::parser::parse_workflow(
            r#"
name: gated
steps:
  - id: detect
    phase: SPECIFICATION
    agent: research
    params:
      result: staging
    outputs: result
  - id: staging_only
    phase: ARCHITECTURE
    agent: analysis
    depends_on: detect
    condition:
      context_equals:
        key: result
        value: staging
  - id: production_only
    phase: ARCHITECTURE
    agent: analysis
    condition:
      context_equals:
        key: result
        value: production
"#,
        )
        .unwrap();
        let orchestrator = orchestrator(AgentRegistry::with_defaults());

        let outcome = orchestrator.run_spec(spec, HashMap::new()).await.unwrap();
        assert!(outcome.is_success(), "{:?}", outcome.error);

        let status = orchestrator.get_status(&outcome.workflow_id).unwrap();
        assert_eq!(status.steps["staging_only"].status, StepStatus::Succeeded);
        assert_eq!(status.steps["production_only"].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_checkpoint_per_phase_and_resume() {
        let memory = Arc::new(MemoryCheckpointStore::new());
        let broken = Arc::new(AtomicBool::new(true));
        let research_calls = Arc::new(AtomicU32::new(0));

        let flag = Arc::clone(&broken);
        let finalize = FnAgent::new(move |_| {
            let broken = flag.load(Ordering::SeqCst);
            async move {
                if broken {
                    Err("replica lagging".into())
                } else {
                    Ok(HashMap::new())
                }
            }
        });
        let calls = Arc::clone(&research_calls);
        let research = FnAgent::new(move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(HashMap::from([("schema".to_string(), json!("v2"))]))
            }
        });
        let registry = AgentRegistry::with_defaults()
            .with_agent(AgentKind::Research, research)
            .with_agent(AgentKind::Analysis, finalize);

        let spec = WorkflowSpec::new("resumable")
            .with_id("resumable")
            .with_step(
                WorkflowStep::new("inspect", Phase::Specification, AgentKind::Research)
                    .with_output("schema"),
            )
            .with_step(WorkflowStep::new("design", Phase::Architecture, AgentKind::CodeGeneration))
            .with_step(WorkflowStep::new("finalize", Phase::Completion, AgentKind::Analysis));

        let mut orchestrator = orchestrator(registry);
        orchestrator.set_checkpoint_store(memory.clone());

        let first = orchestrator.run_spec(spec.clone(), HashMap::new()).await.unwrap();
        assert_eq!(first.status, WorkflowRunStatus::Failed);
        assert_eq!(memory.save_count("resumable"), 2);
        assert_eq!(
            orchestrator.get_status("resumable").unwrap().last_checkpoint,
            Some(Phase::Architecture)
        );

        broken.store(false, Ordering::SeqCst);
        let seed = HashMap::from([
            ("schema".to_string(), json!("v1")),
            ("operator".to_string(), json!("alice")),
        ]);
        let resumed = orchestrator.resume(spec, seed).await.unwrap();
        assert!(resumed.is_success(), "{:?}", resumed.error);
        assert_eq!(research_calls.load(Ordering::SeqCst), 1);
        assert_eq!(resumed.context.get("schema"), Some(&json!("v2")));
        assert_eq!(resumed.context.get("operator"), Some(&json!("alice")));
        assert_eq!(resumed.counts.succeeded, 3);
        assert_eq!(
            resumed.completed_phases,
            vec![Phase::Specification, Phase::Architecture, Phase::Completion]
        );
        assert_eq!(memory.save_count("resumable"), 3);
    }

    #[tokio::test]
    async fn test_resume_errors() {
        let orchestrator = orchestrator(AgentRegistry::with_defaults());
        let step = WorkflowStep::new("a", Phase::Specification, AgentKind::Research);

        let no_id = WorkflowSpec::new("x").with_step(step.clone());
        assert!(matches!(
            orchestrator.resume(no_id, HashMap::new()).await,
            Err(WorkflowError::MissingWorkflowId)
        ));

        let never_ran = WorkflowSpec::new("x").with_id("never-ran").with_step(step);
        assert!(matches!(
            orchestrator.resume(never_ran, HashMap::new()).await,
            Err(WorkflowError::NoCheckpoint(id)) if id == "never-ran"
        ));
    }

    #[tokio::test]
    async fn test_get_status_idempotent() {
        let orchestrator = orchestrator(AgentRegistry::with_defaults());
        let id = orchestrator.submit_workflow(fullstack_spec()).unwrap();

        let before = orchestrator.get_status(&id).unwrap();
        assert_eq!(before.status, WorkflowRunStatus::Pending);
        assert_eq!(before, orchestrator.get_status(&id).unwrap());

        orchestrator.run(&id, HashMap::new()).await.unwrap();
        let after = orchestrator.get_status(&id).unwrap();
        assert_eq!(after.status, WorkflowRunStatus::Succeeded);
        assert_eq!(after, orchestrator.get_status(&id).unwrap());
        assert!(after.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_denied_operation_fails_workflow() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = AgentRegistry::new().with_agent(AgentKind::CommandExecution, counting_agent(&calls));
        let safety = SafetyController::new(SafetyPolicy::default())
            .unwrap()
            .with_approval_channel(CallbackApproval::deny_all("change freeze"));
        let orchestrator = Orchestrator::new(Arc::new(registry), Arc::new(safety));

        let spec = WorkflowSpec::new("cleanup").with_step(
            WorkflowStep::new("drop_users", Phase::Refinement, AgentKind::CommandExecution)
                .with_operation(OperationCategory::DatabaseDdl, "DROP TABLE users"),
        );
        let outcome = orchestrator.run_spec(spec, HashMap::new()).await.unwrap();

        assert_eq!(outcome.status, WorkflowRunStatus::Failed);
        assert_eq!(outcome.failed_step.as_deref(), Some("drop_users"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let entries = orchestrator.query_audit_log(&AuditFilter::new());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision, AuditDecision::Denied);
        assert_eq!(entries[0].statement, "DROP TABLE users");
    }

    #[tokio::test]
    async fn test_already_running() {
        let orchestrator = orchestrator(AgentRegistry::with_defaults());
        let spec = WorkflowSpec::new("slow").with_step(
            WorkflowStep::new("wait", Phase::Specification, AgentKind::Research)
                .with_params(json!({"delay_ms": 100})),
        );
        let id = orchestrator.submit_workflow(spec).unwrap();

        let (first, second) = tokio::join!(orchestrator.run(&id, HashMap::new()), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            orchestrator.run(&id, HashMap::new()).await
        });

        assert!(first.unwrap().is_success());
        assert!(matches!(second, Err(WorkflowError::AlreadyRunning(_))));
    }

    #[tokio::test]
    async fn test_unknown_workflow_and_agent() {
        let orchestrator = orchestrator(AgentRegistry::new());
        assert!(matches!(
            orchestrator.get_status("missing"),
            Err(WorkflowError::UnknownWorkflow(_))
        ));

        let spec = WorkflowSpec::new("x")
            .with_step(WorkflowStep::new("a", Phase::Specification, AgentKind::Research));
        assert!(matches!(
            orchestrator.submit_workflow(spec),
            Err(WorkflowError::UnknownAgent(kind)) if kind == "research"
        ));
    }

    #[tokio::test]
    async fn test_visualize() {
        let orchestrator = orchestrator(AgentRegistry::with_defaults());
        let id = orchestrator
            .submit_workflow(fullstack_spec().with_id("fullstack-1"))
            .unwrap();

        let graph = orchestrator.visualize(&id).unwrap();
        assert_eq!(graph.phases.len(), 5);
        assert_eq!(graph.step_count(), 4);
        assert!(graph.phases[1].steps.is_empty());

        let text = graph.to_string();
        assert!(text.contains("Workflow: fullstack [fullstack-1]"));
        assert!(text.contains("PSEUDOCODE\n  (no steps)"));
        assert!(text.contains("integrate (analysis) <- frontend, backend"));
        assert!(text.contains("[PENDING  ]"));
        assert_eq!(graph, orchestrator.visualize(&id).unwrap());
    }

    #[tokio::test]
    async fn test_run_parallel_delegates() {
        let orchestrator = orchestrator(AgentRegistry::new());
        let tasks = (0..10)
            .map(|i| {
                ParallelTask::new(format!("t{}", i), move || async move {
                    if i % 3 == 0 {
                        Err("odd one out".into())
                    } else {
                        Ok(json!(i))
                    }
                })
            })
            .collect();

        let result = orchestrator
            .run_parallel(tasks, AggregationStrategy::Majority)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.succeeded(), 6);
    }
}
