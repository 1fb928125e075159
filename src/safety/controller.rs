//! Safety Controller
//!
//! Classifies every prospective operation, gates it on approval when the
//! risk reaches the policy threshold, and writes exactly one audit entry per
//! gated call.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use log::{debug, info, warn};

use super::analyzer::{RiskAnalyzer, SqlStatementAnalyzer};
use super::approval::{ApprovalChannel, ApprovalDecision, ApprovalRecord, ApprovalRequest};
use super::audit::{AuditDecision, AuditEntry, AuditFilter, AuditLog, AuditSink};
use super::policy::{PolicyError, QuorumOutcome, QuorumRule, SafetyPolicy};
use super::risk::{CompiledPattern, Operation, RiskAssessment, RiskLevel};
use super::SafetyViolation;

/// Risk gate in front of every side-effecting operation.
///
/// # Example
///
/// ```rust,no_run
/// use dbflow::safety::{CallbackApproval, Operation, OperationCategory, SafetyController, SafetyPolicy};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let safety = SafetyController::new(SafetyPolicy::default())?
///     .with_approval_channel(CallbackApproval::approve_all());
///
/// let op = Operation::new(OperationCategory::DatabaseRead, "SELECT count(*) FROM users");
/// let rows = safety.validate_and_execute(&op, || async { 42 }).await?;
/// # Ok(())
/// # }
/// ```
pub struct SafetyController {
    policy: SafetyPolicy,
    patterns: Vec<CompiledPattern>,
    analyzer: Option<Arc<dyn RiskAnalyzer>>,
    approval: Option<Arc<dyn ApprovalChannel>>,
    audit: AuditLog,
    approvals: RwLock<Vec<ApprovalRecord>>,
}

impl SafetyController {
    /// Creates a controller with the built-in SQL analyzer and no approval
    /// channel (approval-requiring operations are denied).
    pub fn new(policy: SafetyPolicy) -> Result<Self, PolicyError> {
        let patterns = policy.compile_patterns()?;
        Ok(Self {
            policy,
            patterns,
            analyzer: Some(Arc::new(SqlStatementAnalyzer::new())),
            approval: None,
            audit: AuditLog::new(),
            approvals: RwLock::new(Vec::new()),
        })
    }

    pub fn with_analyzer<A: RiskAnalyzer + 'static>(mut self, analyzer: A) -> Self {
        self.analyzer = Some(Arc::new(analyzer));
        self
    }

    pub fn without_analyzer(mut self) -> Self {
        self.analyzer = None;
        self
    }

    pub fn with_approval_channel<C: ApprovalChannel + 'static>(mut self, channel: C) -> Self {
        self.approval = Some(Arc::new(channel));
        self
    }

    /// Mirrors audit entries to a sink. Replaces the (empty) log.
    pub fn with_audit_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.audit = AuditLog::with_sink(sink);
        self
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Classifies an operation without recording anything.
    pub fn assess_risk(&self, operation: &Operation) -> RiskAssessment {
        let mut level = self.policy.category_risk(operation.category);
        let mut matched_patterns = Vec::new();

        for pattern in self.patterns.iter().filter(|p| p.matches(operation)) {
            matched_patterns.push(pattern.name.clone());
            level = level.max(pattern.level);
        }

        let mut analyzer_verdict = None;
        let mut analyzer_notes = Vec::new();
        if let Some(analyzer) = self.analyzer.as_ref().filter(|_| operation.category.is_sql()) {
            match analyzer.analyze(&operation.statement) {
                Ok(verdict) => {
                    level = level.max(verdict.level);
                    analyzer_verdict = Some(verdict.level);
                    analyzer_notes = verdict.findings;
                }
                Err(e) => {
                    warn!("Risk analysis failed for {}: {}", operation.id, e);
                    level = level.max(RiskLevel::High);
                    analyzer_notes.push(e.to_string());
                }
            }
        }

        RiskAssessment {
            operation: operation.clone(),
            category: operation.category,
            risk_level: level,
            matched_patterns,
            analyzer_verdict,
            analyzer_notes,
            blocked: self.policy.is_blocked(operation.category),
            requires_approval: level >= self.policy.approval_threshold,
        }
    }

    /// Runs `action` only if the operation passes the gate.
    ///
    /// Blocked categories are rejected without consulting the approval
    /// channel. Operations below the threshold run immediately. Others wait
    /// for the channel's votes (bounded by the policy timeout); CRITICAL
    /// operations need the policy quorum, the rest a single approval.
    pub async fn validate_and_execute<F, Fut, T>(
        &self,
        operation: &Operation,
        action: F,
    ) -> Result<T, SafetyViolation>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let assessment = self.assess_risk(operation);

        if assessment.blocked {
            let violation = SafetyViolation::Blocked {
                operation_id: operation.id.clone(),
                category: operation.category,
            };
            warn!("{}", violation);
            self.audit.append(
                &assessment,
                AuditDecision::Blocked,
                Some(violation.to_string()),
                None,
            );
            return Err(violation);
        }

        if !assessment.requires_approval {
            debug!(
                "Auto-approving {} ({} < {})",
                operation.id, assessment.risk_level, self.policy.approval_threshold
            );
            self.audit
                .append(&assessment, AuditDecision::AutoApproved, None, None);
            return Ok(action().await);
        }

        let record = self.request_approval(&assessment).await;
        match record {
            Ok(record) => {
                info!(
                    "Operation {} approved by {}",
                    operation.id,
                    record.approvers.join(", ")
                );
                self.record_approval(record.clone());
                self.audit
                    .append(&assessment, AuditDecision::Approved, None, Some(record));
                Ok(action().await)
            }
            Err((violation, record)) => {
                warn!("{}", violation);
                self.record_approval(record.clone());
                self.audit.append(
                    &assessment,
                    AuditDecision::Denied,
                    Some(violation.to_string()),
                    Some(record),
                );
                Err(violation)
            }
        }
    }

    async fn request_approval(
        &self,
        assessment: &RiskAssessment,
    ) -> Result<ApprovalRecord, (SafetyViolation, ApprovalRecord)> {
        let operation_id = assessment.operation.id.clone();
        let rule = if assessment.risk_level == RiskLevel::Critical {
            self.policy.quorum
        } else {
            QuorumRule::AtLeast { approvals: 1 }
        };

        let record = |decision, approvers: Vec<String>, reason: Option<String>| ApprovalRecord {
            operation_id: operation_id.clone(),
            risk_level: assessment.risk_level,
            decision,
            approvers,
            reason,
            decided_at: Utc::now(),
        };

        let Some(channel) = &self.approval else {
            let violation = SafetyViolation::Denied {
                operation_id: operation_id.clone(),
                risk_level: assessment.risk_level,
                reason: "no approval channel configured".to_string(),
            };
            let reason = Some(violation.to_string());
            return Err((violation, record(ApprovalDecision::Denied, Vec::new(), reason)));
        };

        let request = ApprovalRequest {
            operation: assessment.operation.clone(),
            assessment: assessment.clone(),
            required_approvers: rule.required_approvers(),
        };

        info!(
            "Requesting approval for {} ({}, {} approver(s))",
            operation_id,
            assessment.risk_level,
            request.required_approvers
        );

        let timeout = self.policy.approval_timeout();
        let response = match tokio::time::timeout(timeout, channel.request_approval(&request)).await
        {
            Ok(response) => response,
            Err(_) => {
                let violation = SafetyViolation::ApprovalTimeout {
                    operation_id: operation_id.clone(),
                    timeout,
                };
                let reason = Some(violation.to_string());
                return Err((violation, record(ApprovalDecision::Denied, Vec::new(), reason)));
            }
        };

        match rule.evaluate(&response.votes) {
            QuorumOutcome::Approved { approvers } => {
                Ok(record(ApprovalDecision::Approved, approvers, None))
            }
            QuorumOutcome::Denied { approver, reason } => {
                let violation = SafetyViolation::Denied {
                    operation_id: operation_id.clone(),
                    risk_level: assessment.risk_level,
                    reason: format!("{} ({})", reason, approver),
                };
                let reason = Some(violation.to_string());
                Err((violation, record(ApprovalDecision::Denied, Vec::new(), reason)))
            }
            QuorumOutcome::Insufficient { approvers, required } => {
                let violation = SafetyViolation::QuorumNotMet {
                    operation_id: operation_id.clone(),
                    required,
                    received: approvers.len(),
                };
                let reason = Some(violation.to_string());
                Err((violation, record(ApprovalDecision::Denied, approvers, reason)))
            }
        }
    }

    fn record_approval(&self, record: ApprovalRecord) {
        self.approvals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Every approval decision made so far, oldest first.
    pub fn approvals(&self) -> Vec<ApprovalRecord> {
        self.approvals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn query_audit_log(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.audit.query(filter)
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }
}

impl std::fmt::Debug for SafetyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyController")
            .field("policy", &self.policy)
            .field("patterns", &self.patterns.len())
            .field("analyzer", &self.analyzer.is_some())
            .field("approval", &self.approval.is_some())
            .field("audit", &self.audit)
            .finish()
    }
}
