//! Ensemble validation.
//!
//! Validators run concurrently against the final artifact; their findings
//! are merged by (location, rule_id), keeping the highest severity any
//! validator reported.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::adapters::ValidatorPort;
use crate::domain::{
    OverallStatus, Severity, ValidationIssue, ValidationResult, ValidatorOutcome, ValidatorSummary,
};

/// Rule id reported when a validator could not produce an outcome
pub const VALIDATOR_UNAVAILABLE: &str = "validator.unavailable";

/// Per-validator time limit unless configured otherwise
pub const DEFAULT_VALIDATOR_TIMEOUT: Duration = Duration::from_secs(300);

/// Name-keyed table of validators
#[derive(Default, Clone)]
pub struct ValidatorRegistry {
    validators: BTreeMap<String, Arc<dyn ValidatorPort>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, validator: Arc<dyn ValidatorPort>) -> Result<()> {
        let name = validator.name().to_string();
        if self.validators.contains_key(&name) {
            bail!("Validator '{}' is already registered", name);
        }
        self.validators.insert(name, validator);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ValidatorPort>> {
        self.validators.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.validators.keys().map(String::as_str)
    }

    /// Look up validators by name, failing on the first unknown one
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn ValidatorPort>>> {
        names
            .iter()
            .map(|name| {
                self.validators
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("Unknown validator '{}'", name))
            })
            .collect()
    }
}

/// Merges validator outcomes into one result
#[derive(Debug, Clone)]
pub struct ValidationAggregator {
    weights: HashMap<String, f64>,
    default_weight: f64,
    timeout: Duration,
}

impl Default for ValidationAggregator {
    fn default() -> Self {
        Self::new(HashMap::new(), 1.0)
    }
}

impl ValidationAggregator {
    pub fn new(weights: HashMap<String, f64>, default_weight: f64) -> Self {
        Self {
            weights,
            default_weight,
            timeout: DEFAULT_VALIDATOR_TIMEOUT,
        }
    }

    /// Limit how long any one validator may run
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Copy with some weights replaced
    pub fn with_overrides(&self, overrides: &HashMap<String, f64>) -> Self {
        let mut weights = self.weights.clone();
        weights.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
        Self {
            weights,
            default_weight: self.default_weight,
            timeout: self.timeout,
        }
    }

    pub fn weight(&self, validator: &str) -> f64 {
        self.weights
            .get(validator)
            .copied()
            .unwrap_or(self.default_weight)
            .max(0.0)
    }

    /// Merge outcomes
    pub fn aggregate(&self, outcomes: &[ValidatorOutcome]) -> ValidationResult {
        let mut merged: BTreeMap<(String, String), ValidationIssue> = BTreeMap::new();
        let mut reporters: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();

        for outcome in outcomes {
            for issue in &outcome.issues {
                let key = (issue.location.clone(), issue.rule_id.clone());
                reporters
                    .entry(key.clone())
                    .or_default()
                    .insert(outcome.validator.clone());

                match merged.get_mut(&key) {
                    Some(existing) if issue.severity > existing.severity => {
                        existing.severity = issue.severity;
                        existing.message = issue.message.clone();
                    }
                    Some(_) => {}
                    None => {
                        merged.insert(key, issue.clone());
                    }
                }
            }
        }

        let issues: Vec<ValidationIssue> = merged
            .into_iter()
            .map(|(key, mut issue)| {
                issue.reported_by = reporters.remove(&key).unwrap_or_default().into_iter().collect();
                issue
            })
            .collect();

        let overall_status = if issues.iter().any(|i| i.severity == Severity::Critical) {
            OverallStatus::Fail
        } else if issues.is_empty() {
            OverallStatus::Pass
        } else {
            OverallStatus::Warning
        };

        let validators: Vec<ValidatorSummary> = outcomes
            .iter()
            .map(|o| ValidatorSummary {
                validator: o.validator.clone(),
                score: o.score.clamp(0.0, 1.0),
                weight: self.weight(&o.validator),
                issue_count: o.issues.len(),
            })
            .collect();

        let total_weight: f64 = validators.iter().map(|v| v.weight).sum();
        let composite_score = if total_weight > 0.0 {
            validators.iter().map(|v| v.weight * v.score).sum::<f64>() / total_weight
        } else {
            0.0
        };

        ValidationResult {
            overall_status,
            composite_score,
            issues,
            validators,
        }
    }

    /// Run validators concurrently and merge their outcomes.
    ///
    /// A validator that errors or runs past the time limit contributes a
    /// critical issue and a zero score instead of aborting the stage.
    pub async fn run(
        &self,
        validators: Vec<Arc<dyn ValidatorPort>>,
        artifact: serde_json::Value,
    ) -> ValidationResult {
        let artifact = Arc::new(artifact);
        let mut set = JoinSet::new();
        let limit = self.timeout;

        for (index, validator) in validators.into_iter().enumerate() {
            let artifact = artifact.clone();
            set.spawn(async move {
                let name = validator.name().to_string();
                let outcome = match tokio::time::timeout(limit, validator.validate(&artifact)).await
                {
                    Ok(Ok(mut outcome)) => {
                        outcome.validator = name;
                        outcome
                    }
                    Ok(Err(e)) => {
                        warn!(validator = %name, error = %e, "Validator failed");
                        unavailable(&name, &e.to_string())
                    }
                    Err(_) => {
                        warn!(validator = %name, timeout_ms = limit.as_millis() as u64, "Validator timed out");
                        unavailable(&name, &format!("no outcome within {:?}", limit))
                    }
                };
                (index, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => outcomes.push(pair),
                Err(e) => warn!(error = %e, "Validator task panicked"),
            }
        }
        // Keep configured order for reproducible summaries
        outcomes.sort_by_key(|(index, _)| *index);
        let outcomes: Vec<_> = outcomes.into_iter().map(|(_, o)| o).collect();

        let result = self.aggregate(&outcomes);
        info!(
            status = ?result.overall_status,
            score = result.composite_score,
            issues = result.issues.len(),
            "Validation aggregated"
        );
        result
    }
}

fn unavailable(validator: &str, message: &str) -> ValidatorOutcome {
    ValidatorOutcome {
        validator: validator.to_string(),
        issues: vec![ValidationIssue::new(
            format!("validator:{}", validator),
            VALIDATOR_UNAVAILABLE,
            Severity::Critical,
            message,
        )],
        score: 0.0,
    }
}
