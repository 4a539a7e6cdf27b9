//! Workflow definitions and loading.
//!
//! Workflows are defined in YAML and describe a DAG of steps. Each step
//! names the agent capability that performs it and the steps it depends on.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A complete workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier (used in CLI output and provenance)
    pub id: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Steps in declaration order
    pub steps: Vec<StepDefinition>,

    /// Budget of active execution time for the whole session
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Default retry policy for steps that do not override it
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Ensemble validation run after every step has succeeded
    #[serde(default)]
    pub validation: Option<ValidationStage>,
}

fn default_timeout_seconds() -> u64 {
    3600
}

impl WorkflowDefinition {
    /// Load a workflow from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a workflow from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse workflow YAML")
    }

    /// Get a step by name
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Session-level timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Retry policy in force for a step
    pub fn retry_policy_for(&self, step: &StepDefinition) -> RetryPolicy {
        step.retry_policy
            .clone()
            .unwrap_or_else(|| self.retry_policy.clone())
    }
}

/// A single step in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name (unique within the workflow)
    pub name: String,

    /// Agent capability that executes this step
    pub capability: String,

    /// Names of steps that must succeed before this one runs
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Hard timeout per attempt (falls back to the orchestrator default)
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Override of the workflow retry policy
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,

    /// Static parameters passed through to the agent
    #[serde(default)]
    pub params: serde_json::Value,

    /// Capability invoked to undo partial work when this step fails
    /// with a compensation-class error
    #[serde(default)]
    pub compensation: Option<String>,

    /// Only run the step if the condition holds; otherwise it is skipped
    #[serde(default)]
    pub run_if: Option<StepCondition>,
}

impl StepDefinition {
    /// Create a step with no dependencies
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            depends_on: Vec::new(),
            timeout_seconds: None,
            retry_policy: None,
            params: serde_json::Value::Null,
            compensation: None,
            run_if: None,
        }
    }

    /// Add predecessors
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Effective per-attempt timeout
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// Condition on an upstream step's output.
///
/// ```yaml
/// run_if:
///   step: detect_format
///   pointer: /format
///   equals: spikeglx
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    /// Upstream step whose output is inspected
    pub step: String,

    /// JSON pointer into the output (empty = whole output)
    #[serde(default)]
    pub pointer: String,

    /// Value the pointed-to field must equal
    pub equals: serde_json::Value,
}

impl StepCondition {
    /// Evaluate against the upstream output, if there is one
    pub fn holds(&self, output: Option<&serde_json::Value>) -> bool {
        output
            .and_then(|o| o.pointer(&self.pointer))
            .map(|v| *v == self.equals)
            .unwrap_or(false)
    }
}

/// Final validation stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationStage {
    /// Names of validators to run
    pub validators: Vec<String>,

    /// Step whose output is the artifact under validation
    /// (defaults to the last declared step)
    #[serde(default)]
    pub artifact_from: Option<String>,

    /// Per-validator score weights (overrides configuration)
    #[serde(default)]
    pub weights: HashMap<String, f64>,
}

/// Retry policy for failed steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fraction of the delay randomized in either direction (0.0 - 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_factor() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Calculate the un-jittered delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_WORKFLOW_YAML: &str = r#"
id: spikeglx-to-nwb
description: Convert a SpikeGLX recording

timeout_seconds: 600

steps:
  - name: detect_format
    capability: format_detection

  - name: collect_metadata
    capability: metadata_questions
    depends_on: [detect_format]

  - name: convert
    capability: conversion
    depends_on: [detect_format, collect_metadata]
    timeout_seconds: 120
    compensation: cleanup_partial_output
    retry_policy:
      max_attempts: 5

validation:
  validators: [nwb_inspector, schema]
  weights:
    nwb_inspector: 2.0
"#;

    #[test]
    fn test_workflow_parsing() {
        let workflow = WorkflowDefinition::from_yaml(TEST_WORKFLOW_YAML).unwrap();

        assert_eq!(workflow.id, "spikeglx-to-nwb");
        assert_eq!(workflow.steps.len(), 3);
        assert_eq!(workflow.timeout(), Duration::from_secs(600));
        assert_eq!(
            workflow.step("convert").unwrap().depends_on,
            vec!["detect_format", "collect_metadata"]
        );

        let validation = workflow.validation.as_ref().unwrap();
        assert_eq!(validation.validators.len(), 2);
        assert_eq!(validation.weights.get("nwb_inspector"), Some(&2.0));
    }

    #[test]
    fn test_step_overrides() {
        let workflow = WorkflowDefinition::from_yaml(TEST_WORKFLOW_YAML).unwrap();
        let convert = workflow.step("convert").unwrap();
        let detect = workflow.step("detect_format").unwrap();

        assert_eq!(workflow.retry_policy_for(convert).max_attempts, 5);
        assert_eq!(workflow.retry_policy_for(detect).max_attempts, 3);
        assert_eq!(
            convert.timeout(Duration::from_secs(300)),
            Duration::from_secs(120)
        );
        assert_eq!(
            detect.timeout(Duration::from_secs(300)),
            Duration::from_secs(300)
        );
        assert_eq!(
            convert.compensation.as_deref(),
            Some("cleanup_partial_output")
        );
    }

    #[test]
    fn test_step_condition() {
        let cond = StepCondition {
            step: "detect_format".into(),
            pointer: "/format".into(),
            equals: serde_json::json!("spikeglx"),
        };

        assert!(cond.holds(Some(&serde_json::json!({"format": "spikeglx"}))));
        assert!(!cond.holds(Some(&serde_json::json!({"format": "openephys"}))));
        assert!(!cond.holds(Some(&serde_json::json!({}))));
        assert!(!cond.holds(None));
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
