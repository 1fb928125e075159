//! Safety Module
//!
//! Risk classification, approval gating and auditing for operations with
//! side effects.
//!
//! # Components
//!
//! - [`SafetyController`]: Assesses risk and gates execution
//! - [`SafetyPolicy`]: Thresholds, blocked categories, patterns and quorum
//! - [`ApprovalChannel`]: Source of approval votes
//! - [`AuditLog`]: Hash-chained record of every gated operation

pub mod analyzer;
pub mod approval;
pub mod audit;
pub mod controller;
pub mod policy;
pub mod risk;

use std::time::Duration;

use thiserror::Error;

pub use analyzer::{AnalyzerError, RiskAnalyzer, RiskVerdict, SqlStatementAnalyzer};
pub use approval::{
    ApprovalChannel, ApprovalDecision, ApprovalRecord, ApprovalRequest, ApprovalResponse,
    ApprovalVote, CallbackApproval, InteractiveApproval, VoteDecision,
};
pub use audit::{
    verify_entries, AuditDecision, AuditEntry, AuditError, AuditFilter, AuditLog, AuditSink,
    ChainViolation, JsonLinesAuditSink,
};
pub use controller::SafetyController;
pub use policy::{load_policy, PolicyError, QuorumRule, SafetyPolicy};
pub use risk::{
    DestructivePattern, Operation, OperationCategory, RiskAssessment, RiskLevel, DEFAULT_PATTERNS,
};

/// Why the safety gate refused an operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SafetyViolation {
    #[error("operation {operation_id} blocked: category {category} is not allowed")]
    Blocked {
        operation_id: String,
        category: OperationCategory,
    },

    #[error("operation {operation_id} ({risk_level}) denied: {reason}")]
    Denied {
        operation_id: String,
        risk_level: RiskLevel,
        reason: String,
    },

    #[error("operation {operation_id} denied: {received} of {required} required approvals")]
    QuorumNotMet {
        operation_id: String,
        required: usize,
        received: usize,
    },

    #[error("operation {operation_id} denied: no approval decision within {timeout:?}")]
    ApprovalTimeout {
        operation_id: String,
        timeout: Duration,
    },
}

impl SafetyViolation {
    pub fn operation_id(&self) -> &str {
        match self {
            Self::Blocked { operation_id, .. }
            | Self::Denied { operation_id, .. }
            | Self::QuorumNotMet { operation_id, .. }
            | Self::ApprovalTimeout { operation_id, .. } => operation_id,
        }
    }
}
