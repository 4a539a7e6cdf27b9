//! DAG validation and frontier computation.
//!
//! `validate` runs before a session is created. It rejects empty workflows,
//! duplicate or unknown step references and cycles, and returns a
//! topological order grouped into waves of steps that may run in parallel.
//! Ties are broken by lexical step name so plans are reproducible.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use thiserror::Error;

use crate::domain::{ConversionSession, StepStatus, WorkflowDefinition};

/// Reasons a workflow definition is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("Workflow has no steps")]
    EmptyWorkflow,

    #[error("Step {index} has an empty name")]
    EmptyStepName { index: usize },

    #[error("Duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Step '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Cycle detected among steps: {steps:?}")]
    CycleDetected { steps: Vec<String> },

    #[error("Step '{step}' has a condition on '{condition_step}', which is not one of its dependencies")]
    ConditionNotUpstream { step: String, condition_step: String },

    #[error("Validation artifact step '{0}' does not exist")]
    UnknownArtifactStep(String),
}

/// A validated execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Every step after all of its predecessors
    pub order: Vec<String>,

    /// Maximal sets of steps executable in parallel, in dependency order
    pub waves: Vec<Vec<String>>,
}

/// Validate a workflow and compute its execution plan
pub fn validate(workflow: &WorkflowDefinition) -> Result<ExecutionPlan, DagError> {
    if workflow.steps.is_empty() {
        return Err(DagError::EmptyWorkflow);
    }

    let mut names: HashSet<&str> = HashSet::new();
    for (index, step) in workflow.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(DagError::EmptyStepName { index });
        }
        if !names.insert(step.name.as_str()) {
            return Err(DagError::DuplicateStep(step.name.clone()));
        }
    }

    // predecessors per step, deduplicated
    let mut predecessors: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for step in &workflow.steps {
        let deps = predecessors.entry(step.name.as_str()).or_default();
        for dep in &step.depends_on {
            if dep == &step.name {
                return Err(DagError::SelfDependency(step.name.clone()));
            }
            if !names.contains(dep.as_str()) {
                return Err(DagError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                });
            }
            deps.insert(dep.as_str());
        }

        if let Some(cond) = &step.run_if {
            if !step.depends_on.contains(&cond.step) {
                return Err(DagError::ConditionNotUpstream {
                    step: step.name.clone(),
                    condition_step: cond.step.clone(),
                });
            }
        }
    }

    if let Some(stage) = &workflow.validation {
        if let Some(artifact_step) = &stage.artifact_from {
            if !names.contains(artifact_step.as_str()) {
                return Err(DagError::UnknownArtifactStep(artifact_step.clone()));
            }
        }
    }

    // Kahn's algorithm, one wave at a time
    let mut in_degree: BTreeMap<&str, usize> = predecessors
        .iter()
        .map(|(name, deps)| (*name, deps.len()))
        .collect();

    let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, deps) in &predecessors {
        for dep in deps {
            successors.entry(*dep).or_default().push(*name);
        }
    }

    let mut wave: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut order = Vec::with_capacity(workflow.steps.len());
    let mut waves = Vec::new();

    while !wave.is_empty() {
        let mut next: BTreeSet<&str> = BTreeSet::new();
        for name in &wave {
            in_degree.remove(name);
            for succ in successors.get(name).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        next.insert(*succ);
                    }
                }
            }
        }

        order.extend(wave.iter().map(|s| s.to_string()));
        waves.push(wave.iter().map(|s| s.to_string()).collect());
        wave = next.into_iter().collect();
    }

    if !in_degree.is_empty() {
        return Err(DagError::CycleDetected {
            steps: in_degree.keys().map(|s| s.to_string()).collect(),
        });
    }

    Ok(ExecutionPlan { order, waves })
}

/// Steps that may be dispatched now: pending, with every predecessor
/// succeeded or skipped. Returned in lexical order.
pub fn ready_steps(session: &ConversionSession) -> Vec<String> {
    session
        .workflow
        .steps
        .iter()
        .filter(|step| session.step_status(&step.name) == Some(StepStatus::Pending))
        .filter(|step| {
            step.depends_on.iter().all(|dep| {
                session
                    .step_status(dep)
                    .map(|s| s.is_done())
                    .unwrap_or(false)
            })
        })
        .map(|step| step.name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
