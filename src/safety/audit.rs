//! Audit Log
//!
//! Append-only, hash-chained record of every operation the safety
//! controller saw. Each entry stores the SHA-256 of its own content plus the
//! previous entry's hash, so edits and deletions break the chain.
//!
//! Entries can additionally be mirrored to an [`AuditSink`], e.g. a JSON
//! lines file with [`JsonLinesAuditSink`].

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::approval::ApprovalRecord;
use super::risk::{OperationCategory, RiskAssessment, RiskLevel};

/// Hash used as `previous_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What the safety gate decided for an operation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditDecision {
    /// Below the approval threshold
    AutoApproved,
    Approved,
    Denied,
    /// Category blocked by policy
    Blocked,
}

impl AuditDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, Self::AutoApproved | Self::Approved)
    }
}

impl fmt::Display for AuditDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AutoApproved => "AUTO_APPROVED",
            Self::Approved => "APPROVED",
            Self::Denied => "DENIED",
            Self::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

/// One immutable audit record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub operation_id: String,
    pub category: OperationCategory,
    pub statement: String,
    pub risk_level: RiskLevel,
    pub matched_patterns: Vec<String>,
    pub decision: AuditDecision,
    pub reason: Option<String>,
    pub approval: Option<ApprovalRecord>,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Hash over every field except `hash` itself.
    pub fn compute_hash(&self) -> String {
        let approval = self.approval.as_ref().map(|a| {
            json!({
                "operation_id": a.operation_id,
                "risk_level": a.risk_level,
                "decision": a.decision,
                "approvers": a.approvers,
                "reason": a.reason,
                "decided_at": a.decided_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            })
        });

        let payload = json!({
            "sequence": self.sequence,
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            "operation_id": self.operation_id,
            "category": self.category,
            "statement": self.statement,
            "risk_level": self.risk_level,
            "matched_patterns": self.matched_patterns,
            "decision": self.decision,
            "reason": self.reason,
            "approval": approval,
            "previous_hash": self.previous_hash,
        });

        hex::encode(Sha256::digest(payload.to_string().as_bytes()))
    }
}

/// Filter for [`AuditLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Inclusive lower time bound
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper time bound
    pub to: Option<DateTime<Utc>>,
    pub category: Option<OperationCategory>,
    /// Exact risk level
    pub risk_level: Option<RiskLevel>,
    /// Risk level at or above
    pub min_risk: Option<RiskLevel>,
    pub decision: Option<AuditDecision>,
    pub operation_id: Option<String>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn with_category(mut self, category: OperationCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = Some(level);
        self
    }

    pub fn with_min_risk(mut self, level: RiskLevel) -> Self {
        self.min_risk = Some(level);
        self
    }

    pub fn with_decision(mut self, decision: AuditDecision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_operation(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.from.map_or(true, |from| entry.timestamp >= from)
            && self.to.map_or(true, |to| entry.timestamp <= to)
            && self.category.map_or(true, |c| entry.category == c)
            && self.risk_level.map_or(true, |l| entry.risk_level == l)
            && self.min_risk.map_or(true, |l| entry.risk_level >= l)
            && self.decision.map_or(true, |d| entry.decision == d)
            && self
                .operation_id
                .as_ref()
                .map_or(true, |id| &entry.operation_id == id)
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed audit record on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Where the chain is broken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainViolation {
    #[error("entry {sequence}: stored hash does not match its content")]
    HashMismatch { sequence: u64 },

    #[error("entry {sequence}: previous hash does not link to the prior entry")]
    BrokenLink { sequence: u64 },

    #[error("entry at position {position} has sequence {found}")]
    SequenceGap { position: usize, found: u64 },
}

/// Durable mirror for audit entries.
pub trait AuditSink: Send + Sync {
    fn write(&self, entry: &AuditEntry) -> Result<(), AuditError>;

    /// Newest entry already persisted; a log opened on this sink continues
    /// the chain from it.
    fn last_entry(&self) -> Option<AuditEntry> {
        None
    }
}

/// Appends entries to a file, one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    file: Mutex<File>,
    tail: Option<AuditEntry>,
}

impl JsonLinesAuditSink {
    /// Opens (or creates) the file in append mode and reads its last entry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| AuditError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        let tail = Self::read_entries(&path)?.pop();
        if let Some(entry) = &tail {
            debug!(
                "Continuing audit chain in {} after entry {}",
                path.display(),
                entry.sequence
            );
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            tail,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back every entry in a JSON lines audit file.
    pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>, AuditError> {
        let path = path.as_ref();
        let io_err = |source| AuditError::Io {
            path: path.display().to_string(),
            source,
        };

        let reader = BufReader::new(File::open(path).map_err(io_err)?);
        let mut entries = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|source| AuditError::Malformed {
                line: index + 1,
                source,
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn write(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let io_err = |source| AuditError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let line = serde_json::to_string(entry).map_err(|source| AuditError::Malformed {
            line: entry.sequence as usize,
            source,
        })?;

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "{}", line).map_err(io_err)?;
        file.flush().map_err(io_err)
    }

    fn last_entry(&self) -> Option<AuditEntry> {
        self.tail.clone()
    }
}

/// In-memory hash-chained audit log.
///
/// A log opened on a sink that already holds entries starts its sequence
/// and `previous_hash` where the sink left off; only the new entries are
/// kept in memory.
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    sink: Option<Box<dyn AuditSink>>,
    first_sequence: u64,
    anchor_hash: String,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            sink: None,
            first_sequence: 0,
            anchor_hash: GENESIS_HASH.to_string(),
        }
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Box<dyn AuditSink>) -> Self {
        let (first_sequence, anchor_hash) = match sink.last_entry() {
            Some(last) => (last.sequence + 1, last.hash),
            None => (0, GENESIS_HASH.to_string()),
        };
        Self {
            entries: RwLock::new(Vec::new()),
            sink: Some(sink),
            first_sequence,
            anchor_hash,
        }
    }

    /// Sequence number the first in-memory entry carries.
    pub fn first_sequence(&self) -> u64 {
        self.first_sequence
    }

    /// Appends an entry for an assessed operation and returns it.
    ///
    /// Sequence numbers and hashes are assigned under the write lock, so
    /// concurrent appends still form a single chain.
    pub fn append(
        &self,
        assessment: &RiskAssessment,
        decision: AuditDecision,
        reason: Option<String>,
        approval: Option<ApprovalRecord>,
    ) -> AuditEntry {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let previous_hash = entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| self.anchor_hash.clone());

        let mut entry = AuditEntry {
            sequence: self.first_sequence + entries.len() as u64,
            timestamp: Utc::now(),
            operation_id: assessment.operation.id.clone(),
            category: assessment.category,
            statement: assessment.operation.statement.clone(),
            risk_level: assessment.risk_level,
            matched_patterns: assessment.matched_patterns.clone(),
            decision,
            reason,
            approval,
            previous_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();

        if let Some(sink) = &self.sink {
            // The in-memory chain stays authoritative when the mirror fails
            if let Err(e) = sink.write(&entry) {
                warn!("Failed to mirror audit entry {}: {}", entry.sequence, e);
            }
        }

        debug!(
            "Audit #{}: {} {} ({})",
            entry.sequence, entry.decision, entry.operation_id, entry.risk_level
        );
        entries.push(entry.clone());
        entry
    }

    /// Entries matching the filter, in append order.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verifies the in-memory chain, anchored on the sink's prior tail.
    pub fn verify_chain(&self) -> Result<(), ChainViolation> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        verify_segment(&entries, self.first_sequence, &self.anchor_hash)
    }
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("entries", &self.len())
            .field("first_sequence", &self.first_sequence)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Verifies sequence numbers, per-entry hashes and the links between them.
pub fn verify_entries(entries: &[AuditEntry]) -> Result<(), ChainViolation> {
    verify_segment(entries, 0, GENESIS_HASH)
}

fn verify_segment(
    entries: &[AuditEntry],
    first_sequence: u64,
    anchor_hash: &str,
) -> Result<(), ChainViolation> {
    let mut previous = anchor_hash;

    for (position, entry) in entries.iter().enumerate() {
        if entry.sequence != first_sequence + position as u64 {
            return Err(ChainViolation::SequenceGap {
                position,
                found: entry.sequence,
            });
        }
        if entry.previous_hash != previous {
            return Err(ChainViolation::BrokenLink {
                sequence: entry.sequence,
            });
        }
        if entry.compute_hash() != entry.hash {
            return Err(ChainViolation::HashMismatch {
                sequence: entry.sequence,
            });
        }
        previous = &entry.hash;
    }

    Ok(())
}
