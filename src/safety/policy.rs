//! Safety Policy
//!
//! Declares how operations are classified and gated: category overrides,
//! destructive patterns, the approval threshold, blocked categories and the
//! quorum rule for CRITICAL operations. Policies load from YAML.
//!
//! # Example YAML Format
//!
//! ```yaml
//! approval_threshold: HIGH
//! approval_timeout_ms: 120000
//! blocked_categories: [SYSTEM_COMMAND]
//! category_overrides:
//!   FILE_WRITE: MEDIUM
//! quorum:
//!   mode: at_least
//!   approvals: 2
//! patterns:
//!   - name: vacuum_full
//!     pattern: "(?i)\\bVACUUM\\s+FULL\\b"
//!     level: HIGH
//! ```

use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::approval::{ApprovalVote, VoteDecision};
use super::risk::{CompiledPattern, DestructivePattern, OperationCategory, RiskLevel, DEFAULT_PATTERNS};

/// Default wait for an approval decision before it resolves to a denial.
const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("destructive pattern '{name}' is not a valid regex: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid quorum rule: {0}")]
    InvalidQuorum(String),
}

/// How multiple approvers combine for CRITICAL operations.
///
/// Under either rule a single denial vetoes the operation, and approvals
/// without an approver name never count toward the quorum.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QuorumRule {
    /// `approvers` distinct named approvals; an unnamed vote of any kind
    /// denies.
    Unanimous { approvers: usize },
    /// At least `approvals` distinct named approvals; unnamed approvals are
    /// ignored.
    AtLeast { approvals: usize },
}

/// Result of applying a quorum rule to a set of votes.
#[derive(Debug, Clone, PartialEq)]
pub enum QuorumOutcome {
    Approved { approvers: Vec<String> },
    Denied { approver: String, reason: String },
    Insufficient { approvers: Vec<String>, required: usize },
}

impl QuorumRule {
    /// Number of distinct approvers the rule asks for.
    pub fn required_approvers(&self) -> usize {
        match self {
            Self::Unanimous { approvers } => *approvers,
            Self::AtLeast { approvals } => *approvals,
        }
    }

    /// Applies the rule. The first denial wins; repeated approvals from
    /// one approver count once.
    pub fn evaluate(&self, votes: &[ApprovalVote]) -> QuorumOutcome {
        if let Some(vote) = votes.iter().find(|v| v.decision == VoteDecision::Deny) {
            return QuorumOutcome::Denied {
                approver: vote.approver_identity(),
                reason: vote
                    .reason
                    .clone()
                    .unwrap_or_else(|| "denied by approver".to_string()),
            };
        }

        let mut seen = HashSet::new();
        let mut approvers = Vec::new();
        for vote in votes {
            if vote.is_anonymous() {
                if let Self::Unanimous { .. } = self {
                    return QuorumOutcome::Denied {
                        approver: vote.approver_identity(),
                        reason: "approval without an approver name".to_string(),
                    };
                }
                debug!("Ignoring approval without an approver name");
                continue;
            }
            let who = vote.approver_identity();
            if seen.insert(who.clone()) {
                approvers.push(who);
            } else {
                debug!("Ignoring repeated vote from '{}'", who);
            }
        }

        let required = self.required_approvers();
        if approvers.len() >= required {
            QuorumOutcome::Approved { approvers }
        } else {
            QuorumOutcome::Insufficient { approvers, required }
        }
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.required_approvers() == 0 {
            return Err(PolicyError::InvalidQuorum(
                "at least one approver is required".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for QuorumRule {
    fn default() -> Self {
        Self::AtLeast { approvals: 2 }
    }
}

/// Rules the safety controller enforces.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SafetyPolicy {
    /// Operations at or above this level wait for an approval decision
    pub approval_threshold: RiskLevel,

    /// Categories rejected without asking for approval
    pub blocked_categories: HashSet<OperationCategory>,

    /// Replaces a category's base risk level
    pub category_overrides: HashMap<OperationCategory, RiskLevel>,

    /// Extra destructive patterns
    pub patterns: Vec<DestructivePattern>,

    /// Whether the built-in pattern table is applied as well
    pub include_default_patterns: bool,

    /// Multi-approver rule for CRITICAL operations
    pub quorum: QuorumRule,

    /// Wait for an approval decision; expiry counts as a denial
    pub approval_timeout_ms: u64,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            approval_threshold: RiskLevel::High,
            blocked_categories: HashSet::new(),
            category_overrides: HashMap::new(),
            patterns: Vec::new(),
            include_default_patterns: true,
            quorum: QuorumRule::default(),
            approval_timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
        }
    }
}

impl SafetyPolicy {
    pub fn with_threshold(mut self, level: RiskLevel) -> Self {
        self.approval_threshold = level;
        self
    }

    pub fn block(mut self, category: OperationCategory) -> Self {
        self.blocked_categories.insert(category);
        self
    }

    pub fn with_override(mut self, category: OperationCategory, level: RiskLevel) -> Self {
        self.category_overrides.insert(category, level);
        self
    }

    pub fn with_pattern(mut self, pattern: DestructivePattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn with_quorum(mut self, quorum: QuorumRule) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Approval wait as a duration.
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    /// Risk level a category starts from.
    pub fn category_risk(&self, category: OperationCategory) -> RiskLevel {
        self.category_overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.base_risk())
    }

    pub fn is_blocked(&self, category: OperationCategory) -> bool {
        self.blocked_categories.contains(&category)
    }

    /// Compiles the effective pattern table and checks the quorum rule.
    pub(crate) fn compile_patterns(&self) -> Result<Vec<CompiledPattern>, PolicyError> {
        self.quorum.validate()?;

        let defaults = if self.include_default_patterns {
            DEFAULT_PATTERNS.as_slice()
        } else {
            &[]
        };

        defaults
            .iter()
            .chain(self.patterns.iter())
            .map(DestructivePattern::compile)
            .collect()
    }
}

/// Loads a safety policy from a YAML file.
pub fn load_policy(path: &str) -> Result<SafetyPolicy, PolicyError> {
    info!("Loading safety policy from: {}", path);

    let content = fs::read_to_string(path).map_err(|source| PolicyError::Io {
        path: path.to_string(),
        source,
    })?;

    let policy: SafetyPolicy = serde_yaml::from_str(&content)?;
    policy.compile_patterns()?;

    info!(
        "Policy loaded: threshold {}, {} blocked categories, {} custom patterns",
        policy.approval_threshold,
        policy.blocked_categories.len(),
        policy.patterns.len()
    );
    Ok(policy)
}
