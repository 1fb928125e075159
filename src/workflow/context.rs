//! Shared Workflow Context
//!
//! Key/value map threaded through a workflow run. Steps publish their
//! declared outputs here; later waves and phases read them back. Within a
//! phase a key has a single writer unless the later writer depends on the
//! earlier one.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::WorkflowError;
use super::model::Phase;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkflowContext {
    values: BTreeMap<String, Value>,

    /// Which step last wrote each key, and in which phase
    #[serde(default)]
    writers: BTreeMap<String, (Phase, String)>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context from caller-supplied values.
    pub fn from_values(values: HashMap<String, Value>) -> Self {
        Self {
            values: values.into_iter().collect(),
            writers: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Sets a value outside any step (seed values, tests).
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Snapshot handed to agents.
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Step that wrote a key, if any.
    pub fn writer(&self, key: &str) -> Option<&str> {
        self.writers.get(key).map(|(_, step)| step.as_str())
    }

    /// Merges a step's outputs.
    ///
    /// Fails with `ContextConflict` if another step of the same phase that
    /// is not an ancestor of `step_id` already wrote one of the keys.
    /// Nothing is applied when any key conflicts.
    pub fn merge_outputs(
        &mut self,
        phase: Phase,
        step_id: &str,
        ancestors: &HashSet<String>,
        outputs: Vec<(String, Value)>,
    ) -> Result<(), WorkflowError> {
        for (key, _) in &outputs {
            if let Some((written_in, writer)) = self.writers.get(key) {
                if *written_in == phase && writer != step_id && !ancestors.contains(writer) {
                    warn!(
                        "Context key '{}' written by both '{}' and '{}' in {}",
                        key, writer, step_id, phase
                    );
                    return Err(WorkflowError::ContextConflict {
                        key: key.clone(),
                        first: writer.clone(),
                        second: step_id.to_string(),
                    });
                }
            }
        }

        for (key, value) in outputs {
            debug!("Context '{}' <- {}", key, step_id);
            self.writers
                .insert(key.clone(), (phase, step_id.to_string()));
            self.values.insert(key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn none() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn test_merge_and_read() {
        let mut context = WorkflowContext::new();
        context
            .merge_outputs(
                Phase::Specification,
                "research",
                &none(),
                vec![("table".to_string(), json!("users"))],
            )
            .unwrap();

        assert_eq!(context.get("table"), Some(&json!("users")));
        assert_eq!(context.writer("table"), Some("research"));
        assert_eq!(context.to_map().len(), 1);
    }

    #[test]
    fn test_sibling_conflict_rejected() {
        let mut context = WorkflowContext::new();
        context
            .merge_outputs(
                Phase::Architecture,
                "frontend",
                &none(),
                vec![("port".to_string(), json!(3000))],
            )
            .unwrap();

        let err = context
            .merge_outputs(
                Phase::Architecture,
                "backend",
                &none(),
                vec![
                    ("api".to_string(), json!("/v1")),
                    ("port".to_string(), json!(8080)),
                ],
            )
            .unwrap_err();

        assert!(matches!(err, WorkflowError::ContextConflict { ref key, .. } if key == "port"));
        assert_eq!(context.get("port"), Some(&json!(3000)));
        assert!(!context.contains("api"));
    }

    #[test]
    fn test_descendant_and_later_phase_may_overwrite() {
        let mut context = WorkflowContext::new();
        context
            .merge_outputs(
                Phase::Architecture,
                "draft",
                &none(),
                vec![("schema".to_string(), json!(1))],
            )
            .unwrap();

        let ancestors: HashSet<String> = ["draft".to_string()].into_iter().collect();
        context
            .merge_outputs(
                Phase::Architecture,
                "review",
                &ancestors,
                vec![("schema".to_string(), json!(2))],
            )
            .unwrap();
        assert_eq!(context.get("schema"), Some(&json!(2)));

        context
            .merge_outputs(
                Phase::Refinement,
                "tune",
                &none(),
                vec![("schema".to_string(), json!(3))],
            )
            .unwrap();
        assert_eq!(context.get("schema"), Some(&json!(3)));
    }

    #[test]
    fn test_seed_values_have_no_writer() {
        let mut seed = HashMap::new();
        seed.insert("env".to_string(), json!("staging"));
        let context = WorkflowContext::from_values(seed);

        assert!(context.contains("env"));
        assert_eq!(context.writer("env"), None);
    }
}
