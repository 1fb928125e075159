//! Risk Model
//!
//! Operations, categories, risk levels and the destructive-pattern table
//! used to classify prospective operations.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::policy::PolicyError;

/// Severity of a prospective operation. Totally ordered, `Safe` lowest.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of resource an operation touches.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationCategory {
    DatabaseRead,
    DatabaseWrite,
    DatabaseDdl,
    FileWrite,
    FileDelete,
    SystemCommand,
    Generic,
}

impl OperationCategory {
    /// Categories whose statements are structured queries.
    pub fn is_sql(&self) -> bool {
        matches!(
            self,
            Self::DatabaseRead | Self::DatabaseWrite | Self::DatabaseDdl
        )
    }

    /// Risk of the category before any pattern matching.
    pub fn base_risk(&self) -> RiskLevel {
        match self {
            Self::DatabaseRead => RiskLevel::Safe,
            Self::DatabaseWrite => RiskLevel::Medium,
            Self::DatabaseDdl => RiskLevel::High,
            Self::FileWrite => RiskLevel::Low,
            Self::FileDelete => RiskLevel::High,
            Self::SystemCommand => RiskLevel::Medium,
            Self::Generic => RiskLevel::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatabaseRead => "DATABASE_READ",
            Self::DatabaseWrite => "DATABASE_WRITE",
            Self::DatabaseDdl => "DATABASE_DDL",
            Self::FileWrite => "FILE_WRITE",
            Self::FileDelete => "FILE_DELETE",
            Self::SystemCommand => "SYSTEM_COMMAND",
            Self::Generic => "GENERIC",
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prospective risk-bearing operation submitted to the safety gate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Operation {
    /// Identifier carried into approval records and audit entries
    pub id: String,

    pub category: OperationCategory,

    /// Statement text: SQL, shell command line, path, ...
    pub statement: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Operation {
    /// Creates an operation with a generated id.
    pub fn new(category: OperationCategory, statement: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category,
            statement: statement.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Outcome of classifying an operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub operation: Operation,
    pub category: OperationCategory,
    pub risk_level: RiskLevel,

    /// Names of destructive patterns that matched the statement
    pub matched_patterns: Vec<String>,

    /// Verdict of the syntax-aware analyzer, for SQL categories
    pub analyzer_verdict: Option<RiskLevel>,

    /// Findings reported by the analyzer, or why it could not run
    pub analyzer_notes: Vec<String>,

    /// True when the category is blocked outright by policy
    pub blocked: bool,

    /// True when the risk level reaches the policy's approval threshold
    pub requires_approval: bool,
}

/// A named regular expression that raises an operation's risk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DestructivePattern {
    pub name: String,
    pub pattern: String,
    pub level: RiskLevel,

    /// Categories the pattern applies to; empty means all
    #[serde(default)]
    pub categories: Vec<OperationCategory>,
}

impl DestructivePattern {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>, level: RiskLevel) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            level,
            categories: Vec::new(),
        }
    }

    pub fn for_categories(mut self, categories: &[OperationCategory]) -> Self {
        self.categories = categories.to_vec();
        self
    }

    pub(crate) fn compile(&self) -> Result<CompiledPattern, PolicyError> {
        let regex = Regex::new(&self.pattern).map_err(|source| PolicyError::InvalidPattern {
            name: self.name.clone(),
            source,
        })?;
        Ok(CompiledPattern {
            name: self.name.clone(),
            regex,
            level: self.level,
            categories: self.categories.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledPattern {
    pub name: String,
    pub regex: Regex,
    pub level: RiskLevel,
    pub categories: Vec<OperationCategory>,
}

impl CompiledPattern {
    pub fn matches(&self, operation: &Operation) -> bool {
        (self.categories.is_empty() || self.categories.contains(&operation.category))
            && self.regex.is_match(&operation.statement)
    }
}

/// Built-in destructive patterns, applied unless a policy opts out.
pub static DEFAULT_PATTERNS: Lazy<Vec<DestructivePattern>> = Lazy::new(|| {
    vec![
        DestructivePattern::new(
            "drop_object",
            r"(?i)\bDROP\s+(TABLE|DATABASE|SCHEMA|VIEW|INDEX|USER|ROLE)\b",
            RiskLevel::Critical,
        ),
        DestructivePattern::new(
            "truncate_table",
            r"(?i)\bTRUNCATE\s+(TABLE\s+)?[\w.`\x22\[\]]+",
            RiskLevel::Critical,
        ),
        DestructivePattern::new(
            "unconditional_delete",
            r"(?i)\bDELETE\s+FROM\s+[\w.`\x22\[\]]+\s*(;|$)",
            RiskLevel::Critical,
        ),
        DestructivePattern::new("alter_table", r"(?i)\bALTER\s+TABLE\b", RiskLevel::High),
        DestructivePattern::new(
            "privilege_change",
            r"(?i)\b(GRANT|REVOKE)\s+\w+",
            RiskLevel::High,
        ),
        DestructivePattern::new(
            "recursive_force_delete",
            r"(?i)\brm\s+(-\w*r\w*f\w*|-\w*f\w*r\w*|-r\s+-f|-f\s+-r)\b",
            RiskLevel::Critical,
        ),
        DestructivePattern::new("recursive_delete", r"(?i)\brm\s+-\w*r", RiskLevel::High),
        DestructivePattern::new(
            "filesystem_format",
            r"(?i)\b(mkfs(\.\w+)?|fdisk|wipefs)\b",
            RiskLevel::Critical,
        ),
        DestructivePattern::new(
            "raw_device_write",
            r"(?i)\bdd\s+[^|;]*\bof=/dev/",
            RiskLevel::Critical,
        ),
        DestructivePattern::new("privileged_command", r"\bsudo\s+\S+", RiskLevel::High),
        DestructivePattern::new(
            "remote_script_pipe",
            r"(?i)\b(curl|wget)\b[^|]*\|\s*(ba|z)?sh\b",
            RiskLevel::High,
        ),
        DestructivePattern::new(
            "system_power",
            r"(?i)\b(shutdown|reboot|halt|poweroff)\b",
            RiskLevel::High,
        ),
        DestructivePattern::new(
            "world_writable",
            r"\bchmod\s+(-R\s+)?0?777\b",
            RiskLevel::Medium,
        ),
    ]
});
