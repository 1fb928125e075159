//! Workflow Validation
//!
//! Provides comprehensive validation for workflow definitions including:
//! - Step field validation (ids, attempts, timeouts)
//! - Dependency integrity (unknown, self and forward-phase references)
//! - Cycle detection and topological sorting (Kahn's algorithm)
//! - Output conflicts between concurrent steps of a phase

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, info};

use super::error::WorkflowError;
use super::model::{Phase, WorkflowSpec, WorkflowStep};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    EmptyStepId,
    DuplicateStepId(String),
    UnknownDependency { step: String, dependency: String },
    SelfDependency(String),
    ForwardPhaseDependency {
        step: String,
        dependency: String,
        step_phase: Phase,
        dependency_phase: Phase,
    },
    CyclicDependency(Vec<String>),
    ZeroAttempts(String),
    ZeroTimeout(String),
    ConflictingOutputs { key: String, first: String, second: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::EmptyStepId => write!(f, "Step has empty or whitespace-only ID"),
            Self::DuplicateStepId(id) => write!(f, "Duplicate step ID: '{}'", id),
            Self::UnknownDependency { step, dependency } => {
                write!(f, "Step '{}' depends on unknown step '{}'", step, dependency)
            }
            Self::SelfDependency(step) => write!(f, "Step '{}' depends on itself", step),
            Self::ForwardPhaseDependency {
                step,
                dependency,
                step_phase,
                dependency_phase,
            } => write!(
                f,
                "Step '{}' ({}) depends on '{}' from later phase {}",
                step, step_phase, dependency, dependency_phase
            ),
            Self::CyclicDependency(steps) => write!(
                f,
                "Workflow contains cyclic dependencies between: {}",
                steps.join(", ")
            ),
            Self::ZeroAttempts(step) => {
                write!(f, "Step '{}' has retry.max_attempts of 0", step)
            }
            Self::ZeroTimeout(step) => write!(f, "Step '{}' has a zero timeout", step),
            Self::ConflictingOutputs { key, first, second } => write!(
                f,
                "Steps '{}' and '{}' both output '{}' in the same phase",
                first, second, key
            ),
        }
    }
}

/// Validates a single step's fields.
fn validate_step(step: &WorkflowStep) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return errors; // Can't validate further without ID
    }

    if step.retry.max_attempts == 0 {
        errors.push(ValidationError::ZeroAttempts(step.id.clone()));
    }

    if step.timeout_ms == Some(0) {
        errors.push(ValidationError::ZeroTimeout(step.id.clone()));
    }

    if step.depends_on.iter().any(|d| d == &step.id) {
        errors.push(ValidationError::SelfDependency(step.id.clone()));
    }

    if step.depends_on.is_empty() {
        debug!("Step '{}' is a root step (no dependencies)", step.id);
    }

    errors
}

/// Validates the entire workflow structure.
///
/// Performs the following checks:
/// 1. Workflow is not empty
/// 2. No duplicate step IDs
/// 3. All steps have valid fields
/// 4. Dependencies exist and never point to a later phase
/// 5. No cyclic dependencies
/// 6. No two concurrent steps of a phase declare the same output
///
/// On success, the steps are reordered phase by phase in topological order.
pub fn validate_workflow(spec: &mut WorkflowSpec) -> Result<(), WorkflowError> {
    info!("Validating workflow '{}' with {} steps", spec.name, spec.steps.len());

    if spec.steps.is_empty() {
        return Err(WorkflowError::Validation(vec![ValidationError::EmptyWorkflow]));
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    let mut duplicates = Vec::new();
    for step in &spec.steps {
        if !seen_ids.insert(step.id.as_str()) {
            duplicates.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }
    if !duplicates.is_empty() {
        return Err(WorkflowError::Validation(duplicates));
    }

    let phases: HashMap<&str, Phase> = spec
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.phase))
        .collect();

    let mut all_errors = Vec::new();
    for step in &spec.steps {
        all_errors.extend(validate_step(step));

        for dep in step.depends_on.iter().filter(|d| *d != &step.id) {
            match phases.get(dep.as_str()) {
                None => all_errors.push(ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                }),
                Some(dep_phase) if *dep_phase > step.phase => {
                    all_errors.push(ValidationError::ForwardPhaseDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                        step_phase: step.phase,
                        dependency_phase: *dep_phase,
                    })
                }
                Some(_) => {}
            }
        }
    }

    if !all_errors.is_empty() {
        return Err(WorkflowError::Validation(all_errors));
    }

    topological_sort(spec)?;

    let conflicts = find_output_conflicts(spec);
    if !conflicts.is_empty() {
        return Err(WorkflowError::Validation(conflicts));
    }

    info!(
        "Workflow validated: {} steps across {} phases",
        spec.steps.len(),
        Phase::ALL
            .iter()
            .filter(|p| spec.steps_in(**p).next().is_some())
            .count()
    );
    Ok(())
}

/// Performs topological sort on workflow steps using Kahn's algorithm.
///
/// Among ready steps the earliest phase, then the earliest definition,
/// goes first, so the result is grouped by phase.
fn topological_sort(spec: &mut WorkflowSpec) -> Result<(), WorkflowError> {
    let index: HashMap<&str, usize> = spec
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut in_degree: Vec<usize> = spec.steps.iter().map(|s| s.depends_on.len()).collect();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); spec.steps.len()];
    for (i, step) in spec.steps.iter().enumerate() {
        for dep in &step.depends_on {
            if let Some(&d) = index.get(dep.as_str()) {
                successors[d].push(i);
            }
        }
    }

    // Start with root nodes (in-degree = 0)
    let mut queue: BTreeSet<(usize, usize)> = spec
        .steps
        .iter()
        .enumerate()
        .filter(|(i, _)| in_degree[*i] == 0)
        .map(|(i, s)| (s.phase.index(), i))
        .collect();

    let mut sorted_order: Vec<usize> = Vec::with_capacity(spec.steps.len());

    while let Some(next) = queue.iter().next().copied() {
        queue.remove(&next);
        let current = next.1;
        sorted_order.push(current);

        for &successor in &successors[current] {
            in_degree[successor] -= 1;
            if in_degree[successor] == 0 {
                queue.insert((spec.steps[successor].phase.index(), successor));
            }
        }
    }

    // Check for cycles
    if sorted_order.len() != spec.steps.len() {
        let cyclic: Vec<String> = spec
            .steps
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, s)| s.id.clone())
            .collect();
        return Err(WorkflowError::Validation(vec![
            ValidationError::CyclicDependency(cyclic),
        ]));
    }

    let mut slots: Vec<Option<WorkflowStep>> = spec.steps.drain(..).map(Some).collect();
    spec.steps = sorted_order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect();

    debug!(
        "Topological order: {:?}",
        spec.steps.iter().map(|s| &s.id).collect::<Vec<_>>()
    );

    Ok(())
}

/// Transitive dependencies of every step.
///
/// Expects steps in topological order (as left by [`validate_workflow`]).
pub fn compute_ancestors(steps: &[WorkflowStep]) -> HashMap<String, HashSet<String>> {
    let mut ancestors: HashMap<String, HashSet<String>> = HashMap::new();

    for step in steps {
        let mut set = HashSet::new();
        for dep in &step.depends_on {
            set.insert(dep.clone());
            if let Some(inherited) = ancestors.get(dep) {
                set.extend(inherited.iter().cloned());
            }
        }
        ancestors.insert(step.id.clone(), set);
    }

    ancestors
}

/// Same-phase steps that declare the same output key and may run
/// concurrently (neither is an ancestor of the other).
fn find_output_conflicts(spec: &WorkflowSpec) -> Vec<ValidationError> {
    let ancestors = compute_ancestors(&spec.steps);
    let mut errors = Vec::new();

    for phase in Phase::ALL {
        let mut writers: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in spec.steps_in(phase) {
            for key in &step.outputs {
                writers.entry(key.as_str()).or_default().push(step.id.as_str());
            }
        }

        let mut keys: Vec<_> = writers.into_iter().filter(|(_, w)| w.len() > 1).collect();
        keys.sort();

        for (key, steps) in keys {
            for (i, first) in steps.iter().enumerate() {
                for second in &steps[i + 1..] {
                    let related = ancestors
                        .get(*second)
                        .map_or(false, |a| a.contains(*first))
                        || ancestors
                            .get(*first)
                            .map_or(false, |a| a.contains(*second));
                    if !related {
                        errors.push(ValidationError::ConflictingOutputs {
                            key: key.to_string(),
                            first: first.to_string(),
                            second: second.to_string(),
                        });
                    }
                }
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{AgentKind, RetryPolicy};
    use std::time::Duration;

    fn step(id: &str, phase: Phase) -> WorkflowStep {
        WorkflowStep::new(id, phase, AgentKind::Analysis)
    }

    fn errors_of(mut spec: WorkflowSpec) -> Vec<ValidationError> {
        match validate_workflow(&mut spec) {
            Err(WorkflowError::Validation(errors)) => errors,
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_workflow_sorted_by_phase_and_dependency() {
        let mut spec = WorkflowSpec::new("wf")
            .with_step(step("deploy", Phase::Completion).depends_on("build"))
            .with_step(step("build", Phase::Refinement).depends_on("design"))
            .with_step(step("review", Phase::Architecture).depends_on("design"))
            .with_step(step("design", Phase::Architecture))
            .with_step(step("spec", Phase::Specification));

        validate_workflow(&mut spec).unwrap();

        let order: Vec<_> = spec.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["spec", "design", "review", "build", "deploy"]);
    }

    #[test]
    fn test_empty_workflow() {
        assert_eq!(
            errors_of(WorkflowSpec::new("empty")),
            vec![ValidationError::EmptyWorkflow]
        );
    }

    #[test]
    fn test_duplicate_ids() {
        let spec = WorkflowSpec::new("wf")
            .with_step(step("a", Phase::Specification))
            .with_step(step("a", Phase::Completion));
        assert_eq!(
            errors_of(spec),
            vec![ValidationError::DuplicateStepId("a".to_string())]
        );
    }

    #[test]
    fn test_reference_errors() {
        let spec = WorkflowSpec::new("wf")
            .with_step(step("a", Phase::Specification).depends_on("ghost"))
            .with_step(step("b", Phase::Specification).depends_on("b"))
            .with_step(step("c", Phase::Specification).depends_on("d"))
            .with_step(step("d", Phase::Refinement));

        let errors = errors_of(spec);
        assert!(errors.contains(&ValidationError::UnknownDependency {
            step: "a".to_string(),
            dependency: "ghost".to_string()
        }));
        assert!(errors.contains(&ValidationError::SelfDependency("b".to_string())));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::ForwardPhaseDependency { step, .. } if step == "c")));
    }

    #[test]
    fn test_cycle_detected() {
        let spec = WorkflowSpec::new("wf")
            .with_step(step("a", Phase::Architecture).depends_on("c"))
            .with_step(step("b", Phase::Architecture).depends_on("a"))
            .with_step(step("c", Phase::Architecture).depends_on("b"))
            .with_step(step("free", Phase::Architecture));

        let errors = errors_of(spec);
        assert_eq!(
            errors,
            vec![ValidationError::CyclicDependency(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string()
            ])]
        );
    }

    #[test]
    fn test_step_field_errors() {
        let spec = WorkflowSpec::new("wf")
            .with_step(step("a", Phase::Specification).with_retry(RetryPolicy::new(0)))
            .with_step(step("b", Phase::Specification).with_timeout(Duration::ZERO));

        let errors = errors_of(spec);
        assert!(errors.contains(&ValidationError::ZeroAttempts("a".to_string())));
        assert!(errors.contains(&ValidationError::ZeroTimeout("b".to_string())));
    }

    #[test]
    fn test_sibling_output_conflict() {
        let spec = WorkflowSpec::new("wf")
            .with_step(step("frontend", Phase::Architecture).with_output("port"))
            .with_step(step("backend", Phase::Architecture).with_output("port"));

        assert!(matches!(
            errors_of(spec).as_slice(),
            [ValidationError::ConflictingOutputs { key, .. }] if key == "port"
        ));
    }

    #[test]
    fn test_chained_or_cross_phase_outputs_allowed() {
        let mut spec = WorkflowSpec::new("wf")
            .with_step(step("draft", Phase::Architecture).with_output("schema"))
            .with_step(
                step("review", Phase::Architecture)
                    .depends_on("draft")
                    .with_output("schema"),
            )
            .with_step(step("tune", Phase::Refinement).with_output("schema"));

        assert!(validate_workflow(&mut spec).is_ok());
    }

    #[test]
    fn test_compute_ancestors_is_transitive() {
        let steps = vec![
            step("a", Phase::Specification),
            step("b", Phase::Specification).depends_on("a"),
            step("c", Phase::Pseudocode).depends_on("b"),
        ];
        let ancestors = compute_ancestors(&steps);

        assert!(ancestors["a"].is_empty());
        assert_eq!(ancestors["c"].len(), 2);
        assert!(ancestors["c"].contains("a"));
    }

    #[test]
    fn test_error_messages() {
        let err = ValidationError::ConflictingOutputs {
            key: "port".to_string(),
            first: "a".to_string(),
            second: "b".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Steps 'a' and 'b' both output 'port' in the same phase"
        );
    }
}
