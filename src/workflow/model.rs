//! Workflow Data Model
//!
//! Core data structures for phased agent workflows: steps, phases, retry
//! policies, run conditions and the workflow definition itself.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: add_user_flags
//! steps:
//!   - id: requirements
//!     phase: SPECIFICATION
//!     agent: research
//!     params:
//!       result: { table: users }
//!     outputs: [table]
//!
//!   - id: migrate
//!     phase: REFINEMENT
//!     agent: command_execution
//!     depends_on: requirements
//!     params:
//!       command: psql -c "ALTER TABLE users ADD COLUMN flags int"
//!     operation:
//!       category: DATABASE_DDL
//!       statement: ALTER TABLE users ADD COLUMN flags int
//!     condition:
//!       context_has: table
//!     retry:
//!       max_attempts: 3
//!       backoff_ms: 200
//!     timeout_ms: 30000
//! ```

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use super::context::WorkflowContext;
use crate::safety::{Operation, OperationCategory};

/// Workflow phases, executed strictly in this order.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Specification,
    Pseudocode,
    Architecture,
    Refinement,
    Completion,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Specification,
        Phase::Pseudocode,
        Phase::Architecture,
        Phase::Refinement,
        Phase::Completion,
    ];

    /// Position in the phase sequence.
    pub fn index(&self) -> usize {
        match self {
            Self::Specification => 0,
            Self::Pseudocode => 1,
            Self::Architecture => 2,
            Self::Refinement => 3,
            Self::Completion => 4,
        }
    }

    /// The following phase, `None` after COMPLETION.
    pub fn next(&self) -> Option<Phase> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Specification => "SPECIFICATION",
            Self::Pseudocode => "PSEUDOCODE",
            Self::Architecture => "ARCHITECTURE",
            Self::Refinement => "REFINEMENT",
            Self::Completion => "COMPLETION",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of agent kinds a step can be bound to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    CommandExecution,
    Research,
    CodeGeneration,
    Analysis,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [
        AgentKind::CommandExecution,
        AgentKind::Research,
        AgentKind::CodeGeneration,
        AgentKind::Analysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandExecution => "command_execution",
            Self::Research => "research",
            Self::CodeGeneration => "code_generation",
            Self::Analysis => "analysis",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime status of a step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Waiting for dependencies or its phase
    Pending,
    /// Currently executing (including retries)
    Running,
    Succeeded,
    Failed,
    /// Condition unmet, or optional step that exhausted its retries
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Whether dependents may start.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Overall status of a workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Bounded retries with exponential backoff.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub backoff_ms: u64,
    /// Growth factor applied to the delay after each further failure
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Duration, multiplier: f64) -> Self {
        self.backoff_ms = backoff.as_millis() as u64;
        self.multiplier = multiplier;
        self
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis((self.backoff_ms as f64 * factor).round() as u64)
    }
}

/// Predicate over the shared context deciding whether a ready step runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    ContextHas(String),
    ContextMissing(String),
    ContextEquals { key: String, value: Value },
}

impl StepCondition {
    pub fn is_met(&self, context: &WorkflowContext) -> bool {
        match self {
            Self::ContextHas(key) => context.contains(key),
            Self::ContextMissing(key) => !context.contains(key),
            Self::ContextEquals { key, value } => context.get(key) == Some(value),
        }
    }
}

impl fmt::Display for StepCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextHas(key) => write!(f, "has({})", key),
            Self::ContextMissing(key) => write!(f, "missing({})", key),
            Self::ContextEquals { key, value } => write!(f, "{} == {}", key, value),
        }
    }
}

/// Risk-bearing operation a step declares up front.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OperationSpec {
    pub category: OperationCategory,
    pub statement: String,
}

impl OperationSpec {
    pub fn to_operation(&self, id: impl Into<String>) -> Operation {
        Operation::new(self.category, self.statement.clone()).with_id(id)
    }
}

/// A single step in a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    /// Unique identifier within the workflow
    pub id: String,

    pub phase: Phase,

    /// IDs of steps that must succeed (or be skipped) first
    #[serde(deserialize_with = "single_or_vec", default)]
    pub depends_on: Vec<String>,

    /// Agent that executes the step
    pub agent: AgentKind,

    /// Agent-specific parameters
    #[serde(default)]
    pub params: Value,

    /// Run condition, written as a one-key map (`context_has: env`)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "condition_as_map",
        deserialize_with = "condition_from_map"
    )]
    pub condition: Option<StepCondition>,

    /// Per-attempt timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Failure after all retries skips the step instead of failing the workflow
    #[serde(default)]
    pub optional: bool,

    /// Keys of the agent's output merged into the shared context
    #[serde(deserialize_with = "single_or_vec", default)]
    pub outputs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationSpec>,

    /// Dispatch priority within a wave
    #[serde(default)]
    pub priority: i32,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

fn condition_as_map<S>(condition: &Option<StepCondition>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match condition {
        Some(condition) => serde_yaml::with::singleton_map::serialize(condition, serializer),
        None => serializer.serialize_none(),
    }
}

fn condition_from_map<'de, D>(deserializer: D) -> Result<Option<StepCondition>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_yaml::with::singleton_map::deserialize(deserializer).map(Some)
}

impl WorkflowStep {
    /// Creates a step with no dependencies, a single attempt and no timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use dbflow::workflow::{AgentKind, Phase, RetryPolicy, WorkflowStep};
    ///
    /// let step = WorkflowStep::new("migrate", Phase::Refinement, AgentKind::CommandExecution)
    ///     .depends_on("design")
    ///     .with_retry(RetryPolicy::new(3))
    ///     .with_output("migration_id");
    /// assert_eq!(step.depends_on, vec!["design"]);
    /// ```
    pub fn new(id: impl Into<String>, phase: Phase, agent: AgentKind) -> Self {
        Self {
            id: id.into().trim().to_string(),
            phase,
            depends_on: Vec::new(),
            agent,
            params: Value::Null,
            condition: None,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            optional: false,
            outputs: Vec::new(),
            operation: None,
            priority: 0,
        }
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Declares a context key the step produces.
    pub fn with_output(mut self, key: impl Into<String>) -> Self {
        self.outputs.push(key.into());
        self
    }

    pub fn with_operation(mut self, category: OperationCategory, statement: impl Into<String>) -> Self {
        self.operation = Some(OperationSpec {
            category,
            statement: statement.into(),
        });
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkflowSpec {
    /// Identifier; generated on submission when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub steps: Vec<WorkflowStep>,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Appends a step without checking for duplicates (the validator does).
    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a step to the workflow.
    pub fn add_step(&mut self, step: WorkflowStep) -> Result<(), String> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps of one phase, in definition order.
    pub fn steps_in(&self, phase: Phase) -> impl Iterator<Item = &WorkflowStep> {
        self.steps.iter().filter(move |s| s.phase == phase)
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_sequence() {
        assert_eq!(Phase::Specification.next(), Some(Phase::Pseudocode));
        assert_eq!(Phase::Refinement.next(), Some(Phase::Completion));
        assert_eq!(Phase::Completion.next(), None);
        assert!(Phase::Architecture < Phase::Completion);
        for (i, phase) in Phase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
    }

    #[test]
    fn test_step_builder() {
        let step = WorkflowStep::new(" build ", Phase::Architecture, AgentKind::CodeGeneration)
            .depends_on("design")
            .with_timeout(Duration::from_secs(2))
            .with_output("artifact")
            .with_priority(3)
            .optional();

        assert_eq!(step.id, "build");
        assert_eq!(step.depends_on, vec!["design"]);
        assert_eq!(step.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(step.outputs, vec!["artifact"]);
        assert_eq!(step.priority, 3);
        assert!(step.optional);
        assert_eq!(step.retry.max_attempts, 1);
    }

    #[test]
    fn test_retry_delays_grow() {
        let retry = RetryPolicy::new(4).with_backoff(Duration::from_millis(100), 2.0);
        assert_eq!(retry.delay_after(1), Duration::from_millis(100));
        assert_eq!(retry.delay_after(2), Duration::from_millis(200));
        assert_eq!(retry.delay_after(3), Duration::from_millis(400));
        assert_eq!(RetryPolicy::default().delay_after(1), Duration::ZERO);
    }

    #[test]
    fn test_status_predicates() {
        assert!(StepStatus::Skipped.satisfies_dependency());
        assert!(!StepStatus::Failed.satisfies_dependency());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }

    #[test]
    fn test_conditions() {
        let mut context = WorkflowContext::new();
        context.insert("env", json!("staging"));

        assert!(StepCondition::ContextHas("env".to_string()).is_met(&context));
        assert!(StepCondition::ContextMissing("db".to_string()).is_met(&context));
        assert!(StepCondition::ContextEquals {
            key: "env".to_string(),
            value: json!("staging")
        }
        .is_met(&context));
        assert!(!StepCondition::ContextEquals {
            key: "env".to_string(),
            value: json!("prod")
        }
        .is_met(&context));
    }

    #[test]
    fn test_step_yaml_forms() {
        let yaml = r#"
id: migrate
phase: REFINEMENT
agent: command_execution
depends_on: design
outputs: [version, applied_at]
condition:
  context_equals:
    key: env
    value: staging
operation:
  category: DATABASE_DDL
  statement: ALTER TABLE users ADD COLUMN flags int
"#;
        let step: WorkflowStep = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.depends_on, vec!["design"]);
        assert_eq!(step.outputs.len(), 2);
        assert_eq!(step.agent, AgentKind::CommandExecution);
        assert!(matches!(step.condition, Some(StepCondition::ContextEquals { .. })));
        assert_eq!(
            step.operation.unwrap().category,
            OperationCategory::DatabaseDdl
        );
        assert_eq!(step.retry, RetryPolicy::default());
    }

    #[test]
    fn test_condition_yaml_round_trip() {
        let yaml = "id: gate\nphase: COMPLETION\nagent: analysis\ncondition:\n  context_missing: rollback\n";
        let step: WorkflowStep = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            step.condition,
            Some(StepCondition::ContextMissing("rollback".to_string()))
        );

        let saved = serde_yaml::to_string(&step).unwrap();
        assert!(saved.contains("context_missing: rollback"), "{}", saved);

        let plain: WorkflowStep =
            serde_yaml::from_str("id: plain\nphase: COMPLETION\nagent: analysis\n").unwrap();
        assert!(plain.condition.is_none());
        assert!(!serde_yaml::to_string(&plain).unwrap().contains("condition"));
    }

    #[test]
    fn test_workflow_add_step() {
        let mut workflow = WorkflowSpec::new("wf");
        let step = WorkflowStep::new("a", Phase::Specification, AgentKind::Research);

        assert!(workflow.add_step(step.clone()).is_ok());
        assert!(workflow.add_step(step).is_err());
        assert_eq!(workflow.len(), 1);
        assert!(workflow.get_step("a").is_some());
        assert!(workflow.get_step("missing").is_none());
    }

    #[test]
    fn test_steps_in_phase() {
        let workflow = WorkflowSpec::new("wf")
            .with_step(WorkflowStep::new("a", Phase::Specification, AgentKind::Research))
            .with_step(WorkflowStep::new("b", Phase::Completion, AgentKind::Analysis))
            .with_step(WorkflowStep::new("c", Phase::Specification, AgentKind::Analysis));

        let ids: Vec<_> = workflow
            .steps_in(Phase::Specification)
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(workflow.steps_in(Phase::Pseudocode).count(), 0);
    }
}
