//! Workflow Checkpoints
//!
//! Snapshots saved after each completed phase, enabling a failed or
//! interrupted run to resume with the next phase.
//!
//! [`FileCheckpointStore`] writes `{dir}/{workflow_id}.state` (default
//! directory `.dbflow`); [`MemoryCheckpointStore`] keeps every snapshot in
//! memory.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::context::WorkflowContext;
use super::model::{Phase, StepStatus};

/// Default checkpoint directory.
pub const DEFAULT_CHECKPOINT_DIR: &str = ".dbflow";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted status of one step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSnapshot {
    pub status: StepStatus,
    pub attempts: u32,
}

/// Snapshot of a run after a completed phase.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowCheckpoint {
    pub workflow_id: String,

    /// Last phase that completed
    pub phase: Phase,

    pub steps: BTreeMap<String, StepSnapshot>,

    pub context: WorkflowContext,

    pub saved_at: DateTime<Utc>,
}

impl WorkflowCheckpoint {
    /// Phase a resumed run starts with, `None` if the run had finished.
    pub fn resume_phase(&self) -> Option<Phase> {
        self.phase.next()
    }
}

/// Durable storage for checkpoints.
pub trait CheckpointStore: Send + Sync {
    fn save(
        &self,
        workflow_id: &str,
        phase: Phase,
        checkpoint: &WorkflowCheckpoint,
    ) -> Result<(), CheckpointError>;

    /// Latest checkpoint of a workflow, `None` if it never checkpointed.
    fn load(&self, workflow_id: &str) -> Result<Option<WorkflowCheckpoint>, CheckpointError>;
}

/// One JSON file per workflow.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the checkpoint file path for a workflow.
    pub fn path_for(&self, workflow_id: &str) -> PathBuf {
        let stem: String = workflow_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.state", stem))
    }

    /// Deletes the checkpoint file, if any.
    pub fn delete(&self, workflow_id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(workflow_id);
        if path.exists() {
            fs::remove_file(&path).map_err(|source| io_error(&path, source))?;
            info!("Deleted checkpoint: {}", path.display());
        }
        Ok(())
    }
}

impl Default for FileCheckpointStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_DIR)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(
        &self,
        workflow_id: &str,
        phase: Phase,
        checkpoint: &WorkflowCheckpoint,
    ) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir).map_err(|source| io_error(&self.dir, source))?;

        let path = self.path_for(workflow_id);
        let tmp = path.with_extension("state.tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;

        // Write-then-rename; readers never see a partial file
        fs::write(&tmp, json).map_err(|source| io_error(&tmp, source))?;
        fs::rename(&tmp, &path).map_err(|source| io_error(&path, source))?;

        info!(
            "Saved checkpoint for '{}' after {} to {}",
            workflow_id,
            phase,
            path.display()
        );
        Ok(())
    }

    fn load(&self, workflow_id: &str) -> Result<Option<WorkflowCheckpoint>, CheckpointError> {
        let path = self.path_for(workflow_id);
        if !path.exists() {
            debug!("No checkpoint at {}", path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&path).map_err(|source| io_error(&path, source))?;
        let checkpoint: WorkflowCheckpoint = serde_json::from_str(&content)?;

        info!(
            "Loaded checkpoint for '{}' (completed {})",
            workflow_id, checkpoint.phase
        );
        Ok(Some(checkpoint))
    }
}

/// Keeps every saved checkpoint in memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    history: Mutex<HashMap<String, Vec<WorkflowCheckpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All checkpoints saved for a workflow, oldest first.
    pub fn history(&self, workflow_id: &str) -> Vec<WorkflowCheckpoint> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of saves for a workflow.
    pub fn save_count(&self, workflow_id: &str) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .map_or(0, Vec::len)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(
        &self,
        workflow_id: &str,
        phase: Phase,
        checkpoint: &WorkflowCheckpoint,
    ) -> Result<(), CheckpointError> {
        debug!("Checkpoint for '{}' after {} kept in memory", workflow_id, phase);
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(workflow_id.to_string())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    fn load(&self, workflow_id: &str) -> Result<Option<WorkflowCheckpoint>, CheckpointError> {
        Ok(self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .and_then(|saved| saved.last().cloned()))
    }
}
