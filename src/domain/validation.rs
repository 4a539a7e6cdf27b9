//! Validation outcomes and the aggregated result.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Issue severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A finding reported by a validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Where in the artifact (file path, object path, ...)
    pub location: String,

    /// Identifier of the rule that fired
    pub rule_id: String,

    pub severity: Severity,

    #[serde(default)]
    pub message: String,

    /// Validators that reported this issue (filled in by aggregation)
    #[serde(default)]
    pub reported_by: Vec<String>,
}

impl ValidationIssue {
    pub fn new(
        location: impl Into<String>,
        rule_id: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            rule_id: rule_id.into(),
            severity,
            message: message.into(),
            reported_by: Vec::new(),
        }
    }
}

/// What one validator returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorOutcome {
    pub validator: String,

    #[serde(default)]
    pub issues: Vec<ValidationIssue>,

    /// Quality score in [0, 1]
    pub score: f64,
}

/// Overall verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pass,
    Warning,
    Fail,
}

/// Merged result of all validators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub overall_status: OverallStatus,

    /// Weighted score across validators
    pub composite_score: f64,

    /// Deduplicated issues, sorted by (location, rule_id)
    pub issues: Vec<ValidationIssue>,

    pub validators: Vec<ValidatorSummary>,
}

impl ValidationResult {
    /// Issues at or above a severity
    pub fn issues_at_least(&self, severity: Severity) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(move |i| i.severity >= severity)
    }
}

/// Per-validator contribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSummary {
    pub validator: String,
    pub score: f64,
    pub weight: f64,
    pub issue_count: usize,
}
