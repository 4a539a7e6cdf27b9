//! Shared fixtures: scripted agents, fixed validators and workflow builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use convflow::adapters::{
    AgentError, AgentPort, AgentReply, AgentRequest, FieldProposal, Health, MemoryStorage,
    StoragePort, ValidatorPort,
};
use convflow::core::{CircuitBreakerConfig, OrchestratorSettings};
use convflow::domain::{
    ProvenanceRecord, RecordKind, RetryPolicy, StepDefinition, ValidationIssue,
    ValidationStage, ValidatorOutcome, WorkflowDefinition,
};
use convflow::{Orchestrator, SessionId};

/// What a scripted agent does on one call
#[derive(Debug, Clone)]
pub enum Action {
    Reply(AgentReply),
    Fail(AgentError),
    Delay(Duration, Box<Action>),
}

pub fn completed(output: serde_json::Value) -> Action {
    Action::Reply(AgentReply::output(output))
}

pub fn proposing(output: serde_json::Value, proposals: Vec<FieldProposal>) -> Action {
    Action::Reply(AgentReply::Completed { output, proposals })
}

pub fn proposal(field: &str, value: serde_json::Value, confidence: f64) -> FieldProposal {
    FieldProposal {
        field: field.into(),
        value,
        confidence,
        evidence: vec![format!("observed {}", field)],
    }
}

pub fn needs_input(request: serde_json::Value, required: &[&str]) -> Action {
    Action::Reply(AgentReply::NeedsInput {
        request,
        required: required.iter().map(|s| s.to_string()).collect(),
    })
}

pub fn transient(message: &str) -> Action {
    Action::Fail(AgentError::Transient(message.into()))
}

pub fn permanent(message: &str) -> Action {
    Action::Fail(AgentError::Permanent(message.into()))
}

pub fn needs_compensation(message: &str) -> Action {
    Action::Fail(AgentError::NeedsCompensation(message.into()))
}

pub fn delayed(delay: Duration, action: Action) -> Action {
    Action::Delay(delay, Box::new(action))
}

/// Counter of calls in flight across several agents
#[derive(Debug, Default)]
pub struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Agent that plays back a script, repeating the last action once the
/// script runs out
pub struct ScriptedAgent {
    name: String,
    capability: String,
    script: Mutex<VecDeque<Action>>,
    last: Mutex<Option<Action>>,
    health: Mutex<Health>,
    calls: AtomicU32,
    requests: Mutex<Vec<AgentRequest>>,
    concurrency: Option<Arc<Concurrency>>,
}

impl ScriptedAgent {
    pub fn new(name: &str, capability: &str, script: Vec<Action>) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            health: Mutex::new(Health::Healthy),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            concurrency: None,
        }
    }

    /// Agent that always returns the same output
    pub fn always(name: &str, capability: &str, output: serde_json::Value) -> Self {
        Self::new(name, capability, vec![completed(output)])
    }

    pub fn tracking(mut self, concurrency: Arc<Concurrency>) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn set_health(&self, health: Health) {
        *self.health.lock().unwrap() = health;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_action(&self) -> Action {
        let mut script = self.script.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        if let Some(action) = script.pop_front() {
            *last = Some(action.clone());
            action
        } else {
            last.clone()
                .unwrap_or_else(|| transient("script is empty"))
        }
    }
}

#[async_trait]
impl AgentPort for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> &str {
        &self.capability
    }

    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if let Some(c) = &self.concurrency {
            c.enter();
        }
        let mut action = self.next_action();
        while let Action::Delay(delay, inner) = action {
            tokio::time::sleep(delay).await;
            action = *inner;
        }
        if let Some(c) = &self.concurrency {
            c.exit();
        }

        match action {
            Action::Reply(reply) => Ok(reply),
            Action::Fail(error) => Err(error),
            Action::Delay(..) => unreachable!(),
        }
    }

    async fn health_check(&self) -> Health {
        *self.health.lock().unwrap()
    }
}

/// Validator returning a fixed outcome
pub struct FixedValidator {
    name: String,
    score: f64,
    issues: Vec<ValidationIssue>,
}

impl FixedValidator {
    pub fn new(name: &str, score: f64, issues: Vec<ValidationIssue>) -> Self {
        Self {
            name: name.into(),
            score,
            issues,
        }
    }
}

#[async_trait]
impl ValidatorPort for FixedValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _artifact: &serde_json::Value) -> Result<ValidatorOutcome> {
        Ok(ValidatorOutcome {
            validator: self.name.clone(),
            issues: self.issues.clone(),
            score: self.score,
        })
    }
}

/// Retries without noticeable waiting
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    }
}

pub fn step(name: &str, capability: &str, deps: &[&str]) -> StepDefinition {
    StepDefinition::new(name, capability).after(deps.iter().copied())
}

pub fn workflow(id: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.into(),
        description: String::new(),
        steps,
        timeout_seconds: 60,
        retry_policy: fast_retry(3),
        validation: None,
    }
}

pub fn with_validation(
    mut workflow: WorkflowDefinition,
    validators: &[&str],
) -> WorkflowDefinition {
    workflow.validation = Some(ValidationStage {
        validators: validators.iter().map(|s| s.to_string()).collect(),
        artifact_from: None,
        weights: Default::default(),
    });
    workflow
}

/// Test harness around an in-memory store
pub struct Harness {
    pub storage: Arc<MemoryStorage>,
    pub agents: Vec<Arc<ScriptedAgent>>,
    pub validators: Vec<Arc<dyn ValidatorPort>>,
    pub settings: OrchestratorSettings,
    pub breaker: CircuitBreakerConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            agents: Vec::new(),
            validators: Vec::new(),
            settings: OrchestratorSettings::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }

    pub fn agent(mut self, agent: ScriptedAgent) -> Self {
        self.agents.push(Arc::new(agent));
        self
    }

    pub fn validator(mut self, validator: impl ValidatorPort + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Agent by instance name
    pub fn get(&self, name: &str) -> Arc<ScriptedAgent> {
        self.agents
            .iter()
            .find(|a| a.name() == name)
            .cloned()
            .unwrap_or_else(|| panic!("no agent named {}", name))
    }

    pub fn storage(&self) -> Arc<dyn StoragePort> {
        self.storage.clone()
    }

    /// A fresh orchestrator over the shared store, as after a restart
    pub fn orchestrator(&self) -> Orchestrator {
        let mut builder = Orchestrator::builder(self.storage())
            .settings(self.settings.clone())
            .circuit_breaker(self.breaker.clone());
        for agent in &self.agents {
            builder = builder.agent(agent.clone()).unwrap();
        }
        for validator in &self.validators {
            builder = builder.validator(validator.clone()).unwrap();
        }
        builder.build()
    }
}

/// Provenance records of one kind, optionally for one step
pub async fn records(
    orchestrator: &Orchestrator,
    session_id: SessionId,
    kind: RecordKind,
    step: Option<&str>,
) -> Vec<ProvenanceRecord> {
    orchestrator
        .provenance_tracker()
        .records(session_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.kind == kind)
        .filter(|r| step.is_none() || r.step_name.as_deref() == step)
        .collect()
}

/// Bound a test future so a hung driver fails the test instead of the run
pub async fn settle(orchestrator: &Orchestrator, session_id: SessionId) -> convflow::SessionSummary {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait(session_id))
        .await
        .expect("session did not settle")
        .unwrap()
}

/// Poll until a step reaches a status
pub async fn wait_for_step(
    orchestrator: &Orchestrator,
    session_id: SessionId,
    step: &str,
    status: convflow::domain::StepStatus,
) {
    for _ in 0..500 {
        let summary = orchestrator.status(session_id).await.unwrap();
        if summary.steps.get(step) == Some(&status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("step {} never reached {:?}", step, status);
}
