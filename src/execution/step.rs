//! Individual Step Execution
//!
//! Turns a ready workflow step into a [`ParallelTask`]. The task:
//! - Re-checks the step's dependencies
//! - Passes the step's operation through the safety gate once
//! - Runs the agent with per-attempt timeout, retrying with backoff
//! - Keeps only the declared outputs
//! - Records Started/Retrying/Completed/Failed timeline events

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use super::agents::{Agent, AgentInvocation};
use super::task::{ParallelTask, TaskOutput};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::safety::{Operation, SafetyController};
use crate::workflow::{ExecutionPlanner, WorkflowStep};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything one step needs to run inside the executor.
pub(crate) struct StepRunner {
    pub workflow_id: String,
    pub step: WorkflowStep,
    pub agent: Arc<dyn Agent>,
    pub safety: Arc<SafetyController>,
    pub planner: Arc<Mutex<ExecutionPlanner>>,
    pub timeline: Arc<Mutex<ExecutionTimeline>>,
    /// Context snapshot taken when the step became ready
    pub context: HashMap<String, Value>,
}

impl StepRunner {
    pub(crate) fn into_task(self) -> ParallelTask {
        let id = self.step.id.clone();
        let priority = self.step.priority;
        let phase = self.step.phase.as_str();
        let agent = self.step.agent.as_str();

        ParallelTask::new(id, move || self.execute())
            .with_priority(priority)
            .with_metadata("phase", phase)
            .with_metadata("agent", agent)
    }

    /// Operation gated for this step: the declared one, else the agent's.
    fn operation(&self) -> Option<Operation> {
        self.step
            .operation
            .clone()
            .or_else(|| self.agent.operation(&self.step.params))
            .map(|spec| spec.to_operation(format!("{}/{}", self.workflow_id, self.step.id)))
    }

    async fn execute(self) -> TaskOutput {
        let step_id = self.step.id.clone();

        lock(&self.planner).ensure_dependencies(&step_id)?;
        lock(&self.planner).mark_running(&step_id);
        lock(&self.timeline).add_event(step_id.as_str(), EventType::Started);
        info!("Starting step: {} ({})", step_id, self.step.agent);

        let result = match self.operation() {
            Some(operation) => self
                .safety
                .validate_and_execute(&operation, || self.run_attempts())
                .await
                .unwrap_or_else(|violation| Err(violation.to_string())),
            None => self.run_attempts().await,
        };

        match result {
            Ok(outputs) => {
                lock(&self.timeline).add_event(step_id.as_str(), EventType::Completed);
                info!("Step '{}' completed successfully", step_id);
                Ok(Value::Object(self.select_outputs(outputs)))
            }
            Err(message) => {
                lock(&self.timeline).add_event(step_id.as_str(), EventType::Failed);
                error!("Step '{}' failed: {}", step_id, message);
                Err(message.into())
            }
        }
    }

    async fn run_attempts(&self) -> Result<HashMap<String, Value>, String> {
        let retry = &self.step.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            lock(&self.planner).record_attempt(&self.step.id);

            let invocation = AgentInvocation {
                step_id: self.step.id.clone(),
                attempt,
                params: self.step.params.clone(),
                context: self.context.clone(),
            };

            let pending = self.agent.execute(invocation);
            let result = match self.step.timeout() {
                Some(timeout) => match tokio::time::timeout(timeout, pending).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!("attempt timed out after {:?}", timeout)),
                },
                None => pending.await.map_err(|e| e.to_string()),
            };

            match result {
                Ok(outputs) => return Ok(outputs),
                Err(message) if attempt < max_attempts => {
                    let delay = retry.delay_after(attempt);
                    warn!(
                        "Step '{}' attempt {}/{} failed: {}. Retrying in {:?}",
                        self.step.id, attempt, max_attempts, message, delay
                    );
                    lock(&self.timeline).add_event(self.step.id.as_str(), EventType::Retrying);
                    tokio::time::sleep(delay).await;
                }
                Err(message) => {
                    return Err(if max_attempts > 1 {
                        format!("{} (after {} attempts)", message, attempt)
                    } else {
                        message
                    });
                }
            }
        }
    }

    /// Keeps the declared outputs, in declaration order.
    fn select_outputs(&self, mut outputs: HashMap<String, Value>) -> Map<String, Value> {
        let mut selected = Map::new();
        for key in &self.step.outputs {
            match outputs.remove(key) {
                Some(value) => {
                    selected.insert(key.clone(), value);
                }
                None => warn!("Step '{}' did not produce output '{}'", self.step.id, key),
            }
        }
        if !outputs.is_empty() {
            debug!(
                "Step '{}' dropped undeclared outputs: {:?}",
                self.step.id,
                outputs.keys().collect::<Vec<_>>()
            );
        }
        selected
    }
}
