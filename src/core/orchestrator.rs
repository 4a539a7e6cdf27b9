//! Main orchestrator for workflow sessions.
//!
//! Drives each session's DAG: dispatches every ready step concurrently,
//! checkpoints after each outcome, records provenance for every attempt,
//! suspends when a step needs input and resumes at the checkpointed
//! frontier. Sessions live in an arena keyed by id; all mutation goes
//! through this API.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    AgentPort, AgentReply, AgentRequest, FieldProposal, StoragePort, ValidatorPort,
};
use crate::domain::{
    Activity, AgentInvocation, Annotation, Artifact, ConversionSession, Entity, FailureKind,
    FieldValue, InputKind, InputRequest, NewRecord, ProvAgent, RecordKind, RelationKind,
    SessionFailure, SessionId, SessionState, SessionSummary, StepDefinition, StepStatus,
    WorkflowDefinition,
};

use super::aggregator::{ValidationAggregator, ValidatorRegistry};
use super::coordinator::{
    AgentInvocationCoordinator, AgentRegistry, Attempt, AttemptObserver, DispatchError,
    DispatchOutcome,
};
use super::dag;
use super::error_handler::{CircuitBreakerConfig, ErrorHandler};
use super::provenance::{ExportFormat, ProvenanceTracker, Resolution};
use super::state::{CheckpointError, RetentionPolicy, StateManager};

/// Provenance entity for the input supplied at submission
pub const INPUT_ENTITY: &str = "entity:session-input";

/// Resume input rejected; the session is left unchanged
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Input for step '{step}' must be a JSON object")]
    NotAnObject { step: String },

    #[error("Input for step '{step}' is missing required keys: {missing:?}")]
    MissingKeys { step: String, missing: Vec<String> },
}

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Steps dispatched at once per session (0 = unlimited)
    pub max_parallel_steps: usize,

    /// Per-attempt timeout for steps that do not set one
    pub default_step_timeout: Duration,

    /// How long a suspended session waits for input
    pub suspension_ttl: chrono::Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_parallel_steps: 0,
            default_step_timeout: Duration::from_secs(300),
            suspension_ttl: chrono::Duration::hours(24),
        }
    }
}

/// Builds an `Orchestrator`
pub struct OrchestratorBuilder {
    storage: Arc<dyn StoragePort>,
    agents: AgentRegistry,
    validators: ValidatorRegistry,
    settings: OrchestratorSettings,
    circuit_breaker: CircuitBreakerConfig,
    aggregator: ValidationAggregator,
}

impl OrchestratorBuilder {
    pub fn agent(mut self, agent: Arc<dyn AgentPort>) -> Result<Self> {
        self.agents.register(agent)?;
        Ok(self)
    }

    pub fn agents(mut self, agents: AgentRegistry) -> Self {
        self.agents = agents;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn ValidatorPort>) -> Result<Self> {
        self.validators.register(validator)?;
        Ok(self)
    }

    pub fn validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = validators;
        self
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn aggregator(mut self, aggregator: ValidationAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn build(self) -> Orchestrator {
        let errors = Arc::new(ErrorHandler::new(self.circuit_breaker));
        Orchestrator {
            inner: Arc::new(Inner {
                settings: self.settings,
                coordinator: AgentInvocationCoordinator::new(self.agents, errors),
                state: StateManager::new(self.storage.clone()),
                provenance: ProvenanceTracker::new(self.storage),
                validators: self.validators,
                aggregator: self.aggregator,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Workflow orchestrator (cheap to clone)
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: OrchestratorSettings,
    coordinator: AgentInvocationCoordinator,
    state: StateManager,
    provenance: ProvenanceTracker,
    validators: ValidatorRegistry,
    aggregator: ValidationAggregator,
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
}

/// Arena entry for one session
struct SessionHandle {
    session: tokio::sync::Mutex<ConversionSession>,

    /// Observed between attempts by in-flight steps
    cancel: Arc<AtomicBool>,

    /// Interrupts the driver's wait for step results
    wake: Notify,

    /// True while a driver task owns the session
    driving: watch::Sender<bool>,

    /// Latest checkpointed summary
    progress: watch::Sender<SessionSummary>,
}

impl SessionHandle {
    fn new(session: ConversionSession) -> Arc<Self> {
        let (driving, _) = watch::channel(false);
        let (progress, _) = watch::channel(session.summary());
        Arc::new(Self {
            cancel: Arc::new(AtomicBool::new(session.state.is_terminal())),
            session: tokio::sync::Mutex::new(session),
            wake: Notify::new(),
            driving,
            progress,
        })
    }

    fn is_driving(&self) -> bool {
        *self.driving.borrow()
    }
}

/// Active time accounting for the session watchdog
struct DriverClock {
    base_ms: u64,
    started: Instant,
}

impl DriverClock {
    fn active_ms(&self) -> u64 {
        self.base_ms + self.started.elapsed().as_millis() as u64
    }
}

/// Everything a step task needs, detached from the session lock
struct StepTask {
    session_id: SessionId,
    step: StepDefinition,
    request: AgentRequest,
    timeout: Duration,
    policy: crate::domain::RetryPolicy,
    cancel: Arc<AtomicBool>,

    /// Entities the step consumes
    used: Vec<String>,
}

struct StepResult {
    step_name: String,
    outcome: DispatchOutcome,

    /// First provenance write that failed while the step ran
    provenance_error: Option<String>,
}

impl Orchestrator {
    /// Start building an orchestrator over a store
    pub fn builder(storage: Arc<dyn StoragePort>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            storage,
            agents: AgentRegistry::new(),
            validators: ValidatorRegistry::new(),
            settings: OrchestratorSettings::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            aggregator: ValidationAggregator::default(),
        }
    }

    pub fn provenance_tracker(&self) -> &ProvenanceTracker {
        &self.inner.provenance
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.inner.state
    }

    pub fn coordinator(&self) -> &AgentInvocationCoordinator {
        &self.inner.coordinator
    }

    /// Validate a workflow and start a session for it
    #[instrument(skip(self, workflow, input), fields(workflow = %workflow.id))]
    pub async fn submit(
        &self,
        workflow: WorkflowDefinition,
        input: serde_json::Value,
    ) -> Result<SessionId> {
        let plan = dag::validate(&workflow).context("Workflow rejected")?;
        self.check_bindings(&workflow)?;

        let mut session = ConversionSession::new(workflow, input);
        let session_id = session.session_id;
        session.transition(SessionState::Running)?;

        info!(%session_id, waves = ?plan.waves, "Session created");

        self.inner
            .provenance
            .record(
                session_id,
                NewRecord::new(RecordKind::Session)
                    .with_entity(
                        Entity::new(INPUT_ENTITY, "session input").with_value(session.input.clone()),
                    )
                    .with_agent(ProvAgent::orchestrator())
                    .with_annotation(Annotation::note(format!(
                        "submitted workflow '{}' with {} steps",
                        session.workflow.id,
                        session.workflow.steps.len()
                    ))),
            )
            .await?;
        self.inner
            .state
            .save_checkpoint(&mut session)
            .await
            .context("Failed to write initial checkpoint")?;

        let handle = SessionHandle::new(session);
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, handle.clone());

        self.spawn_driver(handle);
        Ok(session_id)
    }

    /// Every capability and validator a workflow names must be registered
    fn check_bindings(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let registry = self.inner.coordinator.registry();
        for step in &workflow.steps {
            let capabilities = std::iter::once(&step.capability).chain(step.compensation.as_ref());
            for capability in capabilities {
                if !registry.has_capability(capability) {
                    bail!(
                        "Step '{}' needs capability '{}', which no registered agent provides",
                        step.name,
                        capability
                    );
                }
            }
        }

        if let Some(stage) = &workflow.validation {
            self.inner.validators.resolve(&stage.validators)?;
        }
        Ok(())
    }

    /// Current summary of a session
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn status(&self, session_id: SessionId) -> Result<SessionSummary> {
        let handle = self.handle(session_id).await?;
        let mut session = handle.session.lock().await;
        if session.is_expired(Utc::now()) {
            self.expire(&handle, &mut session).await?;
        }
        Ok(session.summary())
    }

    /// Supply input to a suspended session.
    ///
    /// Idempotent for sessions that are not suspended: the current status is
    /// returned, and a running session with no active driver is recovered.
    #[instrument(skip(self, input), fields(session_id = %session_id))]
    pub async fn resume(
        &self,
        session_id: SessionId,
        input: serde_json::Value,
    ) -> Result<SessionSummary> {
        let handle = self.handle(session_id).await?;
        let mut session = handle.session.lock().await;

        if session.is_expired(Utc::now()) {
            self.expire(&handle, &mut session).await?;
            return Ok(session.summary());
        }

        match session.state {
            SessionState::Suspended => {}
            SessionState::Running | SessionState::Analyzing if !handle.is_driving() => {
                drop(session);
                return self.recover(session_id).await;
            }
            _ => return Ok(session.summary()),
        }

        if let Some(request) = session.pending_input().cloned() {
            check_input(&request, &input)?;
            self.apply_input(&mut session, request, input).await?;

            if session.pending_input().is_some() {
                self.persist(&handle, &mut session).await?;
                return Ok(session.summary());
            }
        }

        session.transition(SessionState::Running)?;
        session.expires_at = None;
        info!("Session resumed");
        self.persist(&handle, &mut session).await?;

        let summary = session.summary();
        drop(session);
        self.spawn_driver(handle);
        Ok(summary)
    }

    async fn apply_input(
        &self,
        session: &mut ConversionSession,
        request: InputRequest,
        input: serde_json::Value,
    ) -> Result<()> {
        let session_id = session.session_id;
        let step_name = request.step_name;

        match request.kind {
            InputKind::AgentQuestion { .. } => {
                let entity = format!("entity:{}:supplied:{}", step_name, Uuid::new_v4());
                self.inner
                    .provenance
                    .record(
                        session_id,
                        NewRecord::new(RecordKind::Session)
                            .for_step(&step_name)
                            .with_entity(
                                Entity::new(&entity, format!("input supplied to {}", step_name))
                                    .with_value(input.clone()),
                            )
                            .with_agent(ProvAgent::person())
                            .with_annotation(Annotation::note("input supplied on resume")),
                    )
                    .await?;

                let step = session
                    .step_mut(&step_name)
                    .with_context(|| format!("Unknown step '{}'", step_name))?;
                step.status = StepStatus::Pending;
                step.input_request = None;
                step.supplied_input = Some(input);
                step.supplied_entity = Some(entity);
            }
            InputKind::ConflictResolution {
                field,
                conflict_record,
                ..
            } => {
                let value = input.get("value").cloned().unwrap_or_default();
                let decision = self
                    .inner
                    .provenance
                    .record_human_decision(
                        session_id,
                        &step_name,
                        &field,
                        &conflict_record,
                        value.clone(),
                    )
                    .await?;

                info!(step = %step_name, field = %field, "Conflict settled by human decision");
                session.fields.insert(
                    field,
                    FieldValue {
                        value,
                        confidence: 1.0,
                        source_step: step_name.clone(),
                        entity_id: decision,
                    },
                );

                let step = session
                    .step_mut(&step_name)
                    .with_context(|| format!("Unknown step '{}'", step_name))?;
                if step.queued_requests.is_empty() {
                    step.status = StepStatus::Succeeded;
                    step.input_request = None;
                } else {
                    step.input_request = Some(step.queued_requests.remove(0));
                }
            }
        }
        Ok(())
    }

    /// Stop a session. In-flight calls finish on their own; their results
    /// are discarded.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn cancel(&self, session_id: SessionId) -> Result<SessionSummary> {
        let handle = self.handle(session_id).await?;
        handle.cancel.store(true, Ordering::SeqCst);

        let mut session = handle.session.lock().await;
        if session.state.is_terminal() {
            return Ok(session.summary());
        }

        abandon_steps(&mut session);
        session.transition(SessionState::Cancelled)?;
        session.expires_at = None;
        info!("Session cancelled");

        self.note(session_id, None, "cancelled by request").await?;
        self.persist(&handle, &mut session).await?;
        handle.wake.notify_one();
        Ok(session.summary())
    }

    /// Serialized provenance graph of a session
    pub async fn provenance(&self, session_id: SessionId, format: ExportFormat) -> Result<String> {
        self.handle(session_id).await?;
        self.inner.provenance.export(session_id, format).await
    }

    /// Watch checkpointed summaries of a session
    pub async fn subscribe(&self, session_id: SessionId) -> Result<watch::Receiver<SessionSummary>> {
        Ok(self.handle(session_id).await?.progress.subscribe())
    }

    /// Wait until no driver is running for the session, then report status
    pub async fn wait(&self, session_id: SessionId) -> Result<SessionSummary> {
        let handle = self.handle(session_id).await?;
        let mut driving = handle.driving.subscribe();
        driving
            .wait_for(|active| !*active)
            .await
            .context("Session driver channel closed")?;
        self.status(session_id).await
    }

    /// Reload a session from its newest valid checkpoint and continue it.
    ///
    /// Steps checkpointed as running lost their in-flight call and are
    /// dispatched again.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn recover(&self, session_id: SessionId) -> Result<SessionSummary> {
        let handle = self.handle(session_id).await?;
        if handle.is_driving() {
            return self.status(session_id).await;
        }

        let mut session = handle.session.lock().await;
        if session.is_expired(Utc::now()) {
            self.expire(&handle, &mut session).await?;
            return Ok(session.summary());
        }

        if session.state == SessionState::Analyzing {
            session.transition(SessionState::Running)?;
        }
        if session.state != SessionState::Running {
            return Ok(session.summary());
        }

        let interrupted = session.running_steps();
        for name in &interrupted {
            if let Some(step) = session.step_mut(name) {
                step.status = StepStatus::Pending;
            }
        }
        info!(steps = ?interrupted, "Recovering session");

        self.note(
            session_id,
            None,
            format!("recovered at checkpoint v{}; re-dispatching {:?}", session.checkpoint_version, interrupted),
        )
        .await?;
        handle.cancel.store(false, Ordering::SeqCst);
        self.persist(&handle, &mut session).await?;

        let summary = session.summary();
        drop(session);
        self.spawn_driver(handle);
        Ok(summary)
    }

    /// Fail every suspended session whose input deadline has passed
    pub async fn sweep_expired(&self) -> Result<Vec<SessionId>> {
        let now = Utc::now();
        let mut expired = Vec::new();

        for session_id in self.inner.state.list_sessions().await? {
            let handle = match self.handle(session_id).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(%session_id, error = %e, "Skipping unreadable session");
                    continue;
                }
            };

            let mut session = handle.session.lock().await;
            if session.is_expired(now) {
                self.expire(&handle, &mut session).await?;
                expired.push(session_id);
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired suspended sessions");
        }
        Ok(expired)
    }

    /// Summaries of every stored session, newest first
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for session_id in self.inner.state.list_sessions().await? {
            match self.status(session_id).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(%session_id, error = %e, "Skipping unreadable session"),
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Remove a finished or suspended session with its checkpoints and
    /// provenance
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn delete_session(&self, session_id: SessionId) -> Result<()> {
        let handle = self.handle(session_id).await?;
        {
            let session = handle.session.lock().await;
            if !session.state.is_terminal() && session.state != SessionState::Suspended {
                bail!("Session {} is {}; cancel it first", session_id, session.state);
            }
        }

        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
        let removed = self.inner.state.delete_session(session_id).await?;
        self.inner.provenance.forget(session_id);

        info!(objects = removed, "Session deleted");
        Ok(())
    }

    /// Apply a retention policy to a session's checkpoints
    pub async fn prune_checkpoints(
        &self,
        session_id: SessionId,
        policy: &RetentionPolicy,
    ) -> Result<Vec<u64>> {
        let handle = self.handle(session_id).await?;
        let _session = handle.session.lock().await;
        Ok(self.inner.state.prune(session_id, policy).await?)
    }

    /// Arena lookup, loading from the newest valid checkpoint on a miss
    async fn handle(&self, session_id: SessionId) -> Result<Arc<SessionHandle>> {
        if let Some(handle) = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
        {
            return Ok(handle.clone());
        }

        let loaded = match self.inner.state.load_checkpoint(session_id).await {
            Ok(loaded) => loaded,
            Err(CheckpointError::NotFound(_)) => bail!("Unknown session {}", session_id),
            Err(e @ CheckpointError::NoValidCheckpoint { .. }) => {
                error!(%session_id, error = %e, "Session is unrecoverable");
                return Err(e).context(format!("{:?}", FailureKind::CheckpointCorruption));
            }
            Err(e) => return Err(e).context("Failed to load session"),
        };

        let mut session = loaded.checkpoint.session.clone();
        // Later writes must not collide with versions that exist but are corrupt
        session.checkpoint_version = loaded.highest_version();

        if !loaded.skipped_corrupt.is_empty() {
            self.note(
                session_id,
                None,
                format!(
                    "loaded checkpoint v{} after skipping corrupt versions {:?}",
                    loaded.checkpoint.version, loaded.skipped_corrupt
                ),
            )
            .await?;
        }

        debug!(%session_id, version = loaded.checkpoint.version, "Session loaded");
        let handle = SessionHandle::new(session);
        Ok(self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id)
            .or_insert(handle)
            .clone())
    }

    /// Write a checkpoint and publish the new summary
    async fn persist(&self, handle: &SessionHandle, session: &mut ConversionSession) -> Result<()> {
        self.inner
            .state
            .save_checkpoint(session)
            .await
            .context("Failed to write checkpoint")?;
        handle.progress.send_replace(session.summary());
        Ok(())
    }

    /// Record a lifecycle note
    async fn note(
        &self,
        session_id: SessionId,
        step_name: Option<&str>,
        note: impl Into<String>,
    ) -> Result<()> {
        let mut record = NewRecord::new(RecordKind::Session)
            .with_agent(ProvAgent::orchestrator())
            .with_annotation(Annotation::note(note));
        if let Some(step) = step_name {
            record = record.for_step(step);
        }
        self.inner.provenance.record(session_id, record).await?;
        Ok(())
    }

    async fn expire(&self, handle: &SessionHandle, session: &mut ConversionSession) -> Result<()> {
        handle.cancel.store(true, Ordering::SeqCst);

        let step_name = session.pending_input().map(|r| r.step_name.clone());
        let deadline = session
            .expires_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();

        for name in session.steps_with_status(StepStatus::NeedsInput) {
            if let Some(step) = session.step_mut(&name) {
                step.status = StepStatus::Failed;
                step.last_error = Some("input not supplied in time".to_string());
            }
        }

        let failure = SessionFailure {
            step_name,
            kind: FailureKind::SuspendedInputTimeout,
            message: format!("No input supplied before {}", deadline),
            last_checkpoint_version: session.checkpoint_version,
        };
        warn!(session_id = %session.session_id, failure = %failure, "Suspended session expired");

        session.failure = Some(failure.clone());
        session.transition(SessionState::Failed)?;
        self.note(session.session_id, failure.step_name.as_deref(), failure.to_string())
            .await?;
        self.persist(handle, session).await
    }

    fn spawn_driver(&self, handle: Arc<SessionHandle>) {
        let started = handle.driving.send_if_modified(|driving| {
            if *driving {
                false
            } else {
                *driving = true;
                true
            }
        });
        if !started {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.drive(&handle).await {
                error!(error = %e, "Session driver stopped");
            }
            handle.driving.send_replace(false);
        });
    }

    async fn drive(&self, handle: &Arc<SessionHandle>) -> Result<()> {
        let (session_id, budget, base_ms) = {
            let session = handle.session.lock().await;
            (session.session_id, session.workflow.timeout(), session.active_ms)
        };

        let clock = DriverClock {
            base_ms,
            started: Instant::now(),
        };
        let deadline = tokio::time::Instant::now()
            + budget.saturating_sub(Duration::from_millis(base_ms));

        debug!(%session_id, "Driver started");
        let mut tasks = JoinSet::new();
        let result = self.drive_loop(handle, &clock, deadline, &mut tasks).await;

        if !tasks.is_empty() {
            debug!(%session_id, in_flight = tasks.len(), "Leaving in-flight steps to finish");
        }
        tasks.detach_all();
        result
    }

    async fn drive_loop(
        &self,
        handle: &Arc<SessionHandle>,
        clock: &DriverClock,
        deadline: tokio::time::Instant,
        tasks: &mut JoinSet<StepResult>,
    ) -> Result<()> {
        loop {
            {
                let mut session = handle.session.lock().await;
                if session.state != SessionState::Running {
                    return Ok(());
                }
                session.active_ms = clock.active_ms();
                self.schedule(handle, &mut session, tasks).await?;

                if tasks.is_empty() {
                    if !session.steps_with_status(StepStatus::NeedsInput).is_empty() {
                        return self.suspend(handle, &mut session).await;
                    }
                    if session.all_steps_done() {
                        drop(session);
                        return self.finish(handle, clock, deadline).await;
                    }
                    let stuck = unfinished_steps(&session);
                    error!(steps = ?stuck, "Scheduler stalled with unfinished steps");
                    return self
                        .fail(
                            handle,
                            &mut session,
                            None,
                            FailureKind::Internal,
                            format!("No runnable steps remain: {}", stuck.join(", ")),
                        )
                        .await;
                }
            }

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(result)) => {
                        let mut session = handle.session.lock().await;
                        session.active_ms = clock.active_ms();
                        self.apply(handle, &mut session, result).await?;
                    }
                    Some(Err(e)) => {
                        let mut session = handle.session.lock().await;
                        if session.state == SessionState::Running {
                            self.fail(
                                handle,
                                &mut session,
                                None,
                                FailureKind::TransientAgent,
                                format!("Step task aborted: {}", e),
                            )
                            .await?;
                        }
                    }
                    None => {}
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return self.time_out(handle, clock).await;
                }
                _ = handle.wake.notified() => {}
            }
        }
    }

    /// Dispatch ready steps, skipping those whose condition is false
    async fn schedule(
        &self,
        handle: &Arc<SessionHandle>,
        session: &mut ConversionSession,
        tasks: &mut JoinSet<StepResult>,
    ) -> Result<()> {
        // No new work while a question is outstanding
        if !session.steps_with_status(StepStatus::NeedsInput).is_empty() {
            return Ok(());
        }

        let limit = self.inner.settings.max_parallel_steps;
        let mut changed = false;

        loop {
            let mut skipped = false;

            for name in dag::ready_steps(session) {
                let Some(step) = session.workflow.step(&name).cloned() else {
                    continue;
                };

                if let Some(condition) = &step.run_if {
                    let upstream = session.artifacts.get(&condition.step).map(|a| &a.content);
                    if !condition.holds(upstream) {
                        if let Some(state) = session.step_mut(&name) {
                            state.status = StepStatus::Skipped;
                        }
                        info!(step = %name, condition_step = %condition.step, "Step skipped");
                        self.note(
                            session.session_id,
                            Some(&name),
                            format!("skipped: condition on '{}' not met", condition.step),
                        )
                        .await?;
                        skipped = true;
                        changed = true;
                        continue;
                    }
                }

                if limit > 0 && tasks.len() >= limit {
                    continue;
                }

                self.dispatch_step(handle, session, &step, tasks);
                changed = true;
            }

            // A skip can make further steps ready
            if !skipped {
                break;
            }
        }

        if changed {
            self.persist(handle, session).await?;
        }
        Ok(())
    }

    fn dispatch_step(
        &self,
        handle: &Arc<SessionHandle>,
        session: &mut ConversionSession,
        step: &StepDefinition,
        tasks: &mut JoinSet<StepResult>,
    ) {
        let mut upstream = BTreeMap::new();
        let mut used = vec![INPUT_ENTITY.to_string()];
        for dep in &step.depends_on {
            if let Some(artifact) = session.artifacts.get(dep) {
                upstream.insert(dep.clone(), artifact.content.clone());
                used.push(artifact.entity_id.clone());
            }
        }

        let session_id = session.session_id;
        let input = session.input.clone();
        let policy = session.workflow.retry_policy_for(step);
        let timeout = step.timeout(self.inner.settings.default_step_timeout);

        let mut supplied_input = None;
        if let Some(state) = session.step_mut(&step.name) {
            state.status = StepStatus::Running;
            supplied_input = state.supplied_input.clone();
            used.extend(state.supplied_entity.clone());
        }

        let task = StepTask {
            session_id,
            step: step.clone(),
            request: AgentRequest {
                session_id,
                step_name: step.name.clone(),
                capability: step.capability.clone(),
                attempt: 1,
                input,
                upstream,
                params: step.params.clone(),
                supplied_input,
            },
            timeout,
            policy,
            cancel: handle.cancel.clone(),
            used,
        };

        info!(step = %step.name, capability = %step.capability, "Dispatching step");
        let this = self.clone();
        tasks.spawn(async move { this.run_step(task).await });
    }

    /// Runs inside a step task; never holds the session lock
    async fn run_step(&self, task: StepTask) -> StepResult {
        let recorder = AttemptRecorder {
            tracker: &self.inner.provenance,
            session_id: task.session_id,
            used: &task.used,
            cancel: &task.cancel,
            previous: Mutex::new(None),
            lost: Mutex::new(None),
        };

        let outcome = self
            .inner
            .coordinator
            .dispatch(
                &task.step.capability,
                task.request.clone(),
                task.timeout,
                &task.policy,
                &task.cancel,
                &recorder,
            )
            .await;

        let mut provenance_error = recorder.take_lost();
        if let DispatchOutcome::Failed {
            compensate: true,
            invocation,
            error,
        } = &outcome
        {
            match &task.step.compensation {
                Some(capability) => {
                    if let Err(e) = self.compensate(&task, capability, invocation, error).await {
                        error!(step = %task.step.name, error = %e, "Failed to record compensation");
                        provenance_error.get_or_insert_with(|| format!("{:#}", e));
                    }
                }
                None => warn!(
                    step = %task.step.name,
                    "Step needs compensation but defines no compensating capability"
                ),
            }
        }

        StepResult {
            step_name: task.step.name.clone(),
            outcome,
            provenance_error,
        }
    }

    async fn compensate(
        &self,
        task: &StepTask,
        capability: &str,
        failed: &AgentInvocation,
        error: &DispatchError,
    ) -> Result<()> {
        let mut request = task.request.clone();
        request.capability = capability.to_string();
        request.attempt = 1;
        request.params = serde_json::json!({
            "compensating_step": task.step.name,
            "failed_invocation": failed.invocation_id,
            "error": error.to_string(),
            "params": task.step.params,
        });

        warn!(step = %task.step.name, capability, "Running compensating action");
        let attempt = self
            .inner
            .coordinator
            .invoke(capability, &request, task.timeout)
            .await;

        let outcome = match &attempt.result {
            Ok(_) => "compensation succeeded".to_string(),
            Err(e) => {
                error!(step = %task.step.name, error = %e, "Compensating action failed");
                format!("compensation failed: {}", e)
            }
        };

        let record = attempt_record(RecordKind::Compensation, &attempt, &task.used, None)
            .with_annotation(Annotation {
                evidence: vec![failed.activity_id()],
                note: Some(outcome),
                ..Default::default()
            });
        self.inner.provenance.record(task.session_id, record).await?;
        Ok(())
    }

    /// Fold a step outcome into the session
    async fn apply(
        &self,
        handle: &Arc<SessionHandle>,
        session: &mut ConversionSession,
        result: StepResult,
    ) -> Result<()> {
        let StepResult {
            step_name,
            outcome,
            provenance_error,
        } = result;

        if session.state != SessionState::Running {
            let invocation = match &outcome {
                DispatchOutcome::Replied { invocation, .. }
                | DispatchOutcome::Failed { invocation, .. } => Some(invocation),
                DispatchOutcome::Cancelled { .. } => None,
            };
            if let Some(invocation) = invocation {
                debug!(step = %step_name, "Discarding result of stopped session");
                self.inner
                    .provenance
                    .record(
                        session.session_id,
                        NewRecord::new(RecordKind::CancelledAfterCompletion)
                            .for_step(&step_name)
                            .with_agent(ProvAgent::orchestrator())
                            .with_annotation(Annotation {
                                evidence: vec![invocation.activity_id()],
                                note: Some(format!("result discarded; session is {}", session.state)),
                                ..Default::default()
                            }),
                    )
                    .await?;
            }
            return Ok(());
        }

        // Every attempt must be on record before its outcome counts
        if let Some(message) = provenance_error {
            if let Some(state) = session.step_mut(&step_name) {
                state.status = StepStatus::Failed;
                state.last_error = Some(message.clone());
            }
            return self
                .fail(
                    handle,
                    session,
                    Some(step_name),
                    FailureKind::ProvenanceWrite,
                    format!("Failed to record provenance: {}", message),
                )
                .await;
        }

        match outcome {
            DispatchOutcome::Replied {
                reply: AgentReply::Completed { output, proposals },
                invocation,
            } => {
                let entity = output_entity(&step_name, &invocation);
                session.artifacts.insert(
                    step_name.clone(),
                    Artifact::new(step_name.clone(), output, entity),
                );

                let state = session
                    .step_mut(&step_name)
                    .with_context(|| format!("Unknown step '{}'", step_name))?;
                state.status = StepStatus::Succeeded;
                state.attempts += invocation.attempt_count;
                state.last_activity = Some(invocation.activity_id());
                state.last_error = None;
                state.input_request = None;

                info!(step = %step_name, attempts = invocation.attempt_count, "Step succeeded");
                self.accept_proposals(session, &step_name, &invocation, proposals)
                    .await?;
            }
            DispatchOutcome::Replied {
                reply: AgentReply::NeedsInput { request, required },
                invocation,
            } => {
                let state = session
                    .step_mut(&step_name)
                    .with_context(|| format!("Unknown step '{}'", step_name))?;
                state.status = StepStatus::NeedsInput;
                state.attempts += invocation.attempt_count;
                state.last_activity = Some(invocation.activity_id());
                state.supplied_input = None;
                state.supplied_entity = None;
                state.input_request = Some(InputRequest {
                    step_name: step_name.clone(),
                    kind: InputKind::AgentQuestion { request },
                    required,
                    requested_at: Utc::now(),
                });

                info!(step = %step_name, "Step needs input");
            }
            DispatchOutcome::Failed {
                error,
                invocation,
                compensate,
            } => {
                let kind = if compensate {
                    FailureKind::CompensationRequired
                } else {
                    error.failure_kind()
                };

                let state = session
                    .step_mut(&step_name)
                    .with_context(|| format!("Unknown step '{}'", step_name))?;
                state.status = StepStatus::Failed;
                state.attempts += invocation.attempt_count;
                state.last_activity = Some(invocation.activity_id());
                state.last_error = Some(error.to_string());

                return self
                    .fail(handle, session, Some(step_name), kind, error.to_string())
                    .await;
            }
            DispatchOutcome::Cancelled { .. } => {
                if let Some(state) = session.step_mut(&step_name) {
                    state.status = StepStatus::Pending;
                }
            }
        }

        self.persist(handle, session).await
    }

    /// Keep one value per field; record conflicts and how they were settled
    async fn accept_proposals(
        &self,
        session: &mut ConversionSession,
        step_name: &str,
        invocation: &AgentInvocation,
        proposals: Vec<FieldProposal>,
    ) -> Result<()> {
        for proposal in proposals {
            let candidate = FieldValue {
                entity_id: proposal_entity(step_name, &proposal.field, invocation),
                value: proposal.value,
                confidence: proposal.confidence,
                source_step: step_name.to_string(),
            };

            let existing = session.fields.get(&proposal.field).cloned();
            let Some(existing) = existing else {
                session.fields.insert(proposal.field, candidate);
                continue;
            };

            if existing.value == candidate.value {
                if candidate.confidence > existing.confidence {
                    session.fields.insert(proposal.field, candidate);
                }
                continue;
            }

            let candidates = vec![existing, candidate];
            let conflict = self
                .inner
                .provenance
                .record_conflict(session.session_id, step_name, &proposal.field, &candidates)
                .await?;

            match conflict.resolution {
                Resolution::Chosen(value) => {
                    info!(
                        field = %proposal.field,
                        value = %value.value,
                        confidence = value.confidence,
                        "Conflict resolved by confidence"
                    );
                    session.fields.insert(proposal.field, value);
                }
                Resolution::HumanRequired => {
                    warn!(field = %proposal.field, "Equal-confidence conflict needs a human decision");
                    let request = InputRequest {
                        step_name: step_name.to_string(),
                        kind: InputKind::ConflictResolution {
                            field: proposal.field,
                            conflict_record: conflict.resolution_entity,
                            candidates,
                        },
                        required: vec!["value".to_string()],
                        requested_at: Utc::now(),
                    };

                    let state = session
                        .step_mut(step_name)
                        .with_context(|| format!("Unknown step '{}'", step_name))?;
                    if state.input_request.is_none() {
                        state.status = StepStatus::NeedsInput;
                        state.input_request = Some(request);
                    } else {
                        state.queued_requests.push(request);
                    }
                }
            }
        }
        Ok(())
    }

    async fn suspend(&self, handle: &SessionHandle, session: &mut ConversionSession) -> Result<()> {
        session.transition(SessionState::Suspended)?;
        session.expires_at = Some(Utc::now() + self.inner.settings.suspension_ttl);

        let waiting = session.steps_with_status(StepStatus::NeedsInput);
        info!(steps = ?waiting, "Session suspended awaiting input");

        self.note(
            session.session_id,
            None,
            format!("suspended awaiting input for {:?}", waiting),
        )
        .await?;
        self.persist(handle, session).await
    }

    /// Run the validation stage, if any, and complete the session. The
    /// validation stage still counts against the session watchdog.
    async fn finish(
        &self,
        handle: &SessionHandle,
        clock: &DriverClock,
        deadline: tokio::time::Instant,
    ) -> Result<()> {
        let (session_id, stage, artifact, artifact_entity) = {
            let session = handle.session.lock().await;
            let stage = session.workflow.validation.clone();
            let source = stage
                .as_ref()
                .and_then(|s| s.artifact_from.clone())
                .or_else(|| session.workflow.steps.last().map(|s| s.name.clone()));
            let artifact = source.and_then(|name| session.artifacts.get(&name).cloned());
            (
                session.session_id,
                stage,
                artifact.as_ref().map(|a| a.content.clone()).unwrap_or_default(),
                artifact.map(|a| a.entity_id),
            )
        };

        let validation = match stage {
            Some(stage) => {
                let validators = match self.inner.validators.resolve(&stage.validators) {
                    Ok(validators) => validators,
                    Err(e) => {
                        let mut session = handle.session.lock().await;
                        return self
                            .fail(handle, &mut session, None, FailureKind::Validation, e.to_string())
                            .await;
                    }
                };

                let aggregator = self.inner.aggregator.with_overrides(&stage.weights);
                let result = tokio::select! {
                    result = aggregator.run(validators, artifact) => result,
                    _ = tokio::time::sleep_until(deadline) => {
                        return self.time_out(handle, clock).await;
                    }
                    // Only `cancel` wakes the driver
                    _ = handle.wake.notified() => {
                        debug!(%session_id, "Validation abandoned after cancel");
                        return Ok(());
                    }
                };
                self.record_validation(session_id, &result, artifact_entity.as_deref())
                    .await?;
                Some(result)
            }
            None => None,
        };

        let mut session = handle.session.lock().await;
        if session.state != SessionState::Running {
            return Ok(());
        }

        session.validation = validation;
        session.active_ms = clock.active_ms();
        session.transition(SessionState::Completed)?;
        info!(
            session_id = %session_id,
            validation = ?session.validation.as_ref().map(|v| v.overall_status),
            "Session completed"
        );

        self.note(session_id, None, "completed").await?;
        self.persist(handle, &mut session).await
    }

    async fn record_validation(
        &self,
        session_id: SessionId,
        result: &crate::domain::ValidationResult,
        artifact_entity: Option<&str>,
    ) -> Result<()> {
        let id = Uuid::new_v4();
        let entity = format!("entity:validation:{}", id);
        let activity = format!("activity:validation:{}", id);
        let orchestrator = ProvAgent::orchestrator();

        let mut record = NewRecord::new(RecordKind::Validation)
            .with_activity(Activity {
                id: activity.clone(),
                label: "ensemble validation".to_string(),
                attempt: None,
                status: Some(label(result.overall_status)),
                started_at: Utc::now(),
                ended_at: Some(Utc::now()),
            })
            .with_entity(Entity::new(&entity, "validation result").with_value(serde_json::json!({
                "overall_status": result.overall_status,
                "composite_score": result.composite_score,
                "issues": result.issues.len(),
            })))
            .relate(&entity, RelationKind::WasGeneratedBy, &activity)
            .relate(&activity, RelationKind::WasAssociatedWith, &orchestrator.id)
            .with_agent(orchestrator);

        if let Some(artifact) = artifact_entity {
            record = record
                .relate(&activity, RelationKind::Used, artifact)
                .relate(&entity, RelationKind::WasDerivedFrom, artifact);
        }

        let record = record.with_annotation(Annotation {
            confidence: Some(result.composite_score),
            evidence: result
                .validators
                .iter()
                .map(|v| format!("{}: score {:.2}, weight {}, {} issues", v.validator, v.score, v.weight, v.issue_count))
                .collect(),
            method: Some("ensemble".to_string()),
            note: None,
        });

        self.inner.provenance.record(session_id, record).await?;
        Ok(())
    }

    async fn fail(
        &self,
        handle: &SessionHandle,
        session: &mut ConversionSession,
        step_name: Option<String>,
        kind: FailureKind,
        message: String,
    ) -> Result<()> {
        // Stop retries on other branches
        handle.cancel.store(true, Ordering::SeqCst);

        let failure = SessionFailure {
            step_name,
            kind,
            message,
            last_checkpoint_version: session.checkpoint_version,
        };
        error!(session_id = %session.session_id, failure = %failure, "Session failed");

        abandon_steps(session);
        session.failure = Some(failure.clone());
        session.transition(SessionState::Failed)?;

        // The failure must reach the checkpoint even when provenance is what broke
        if let Err(e) = self
            .note(session.session_id, failure.step_name.as_deref(), failure.to_string())
            .await
        {
            error!(session_id = %session.session_id, error = %e, "Failed to record session failure");
        }
        self.persist(handle, session).await
    }

    async fn time_out(&self, handle: &SessionHandle, clock: &DriverClock) -> Result<()> {
        handle.cancel.store(true, Ordering::SeqCst);

        let mut session = handle.session.lock().await;
        if session.state != SessionState::Running {
            return Ok(());
        }

        session.active_ms = clock.active_ms();
        let failure = SessionFailure {
            step_name: None,
            kind: FailureKind::SessionTimeout,
            message: format!(
                "Session exceeded its {}s budget of active time",
                session.workflow.timeout_seconds
            ),
            last_checkpoint_version: session.checkpoint_version,
        };
        warn!(session_id = %session.session_id, failure = %failure, "Session watchdog fired");

        abandon_steps(&mut session);
        session.failure = Some(failure.clone());
        session.transition(SessionState::Cancelled)?;

        self.note(session.session_id, None, failure.to_string()).await?;
        self.persist(handle, &mut session).await
    }
}

/// Records every attempt of one step as it finishes
struct AttemptRecorder<'a> {
    tracker: &'a ProvenanceTracker,
    session_id: SessionId,
    used: &'a [String],
    cancel: &'a AtomicBool,

    /// Activity of the previous attempt, for `retryOf`
    previous: Mutex<Option<String>>,

    /// First record that could not be written
    lost: Mutex<Option<String>>,
}

impl AttemptRecorder<'_> {
    fn take_lost(&self) -> Option<String> {
        self.lost.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[async_trait]
impl AttemptObserver for AttemptRecorder<'_> {
    async fn on_attempt(&self, attempt: &Attempt) {
        let kind = if self.cancel.load(Ordering::SeqCst) {
            RecordKind::CancelledAfterCompletion
        } else {
            RecordKind::Invocation
        };

        let previous = self
            .previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(attempt.invocation.activity_id());

        let record = attempt_record(kind, attempt, self.used, previous.as_deref());
        if let Err(e) = self.tracker.record(self.session_id, record).await {
            error!(
                step = %attempt.invocation.step_name,
                error = %e,
                "Failed to record invocation"
            );
            self.lost
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert_with(|| format!("{:#}", e));
        }
    }
}

/// Provenance record for one attempt: the activity, the agent behind it,
/// the entities it used and generated
fn attempt_record(
    kind: RecordKind,
    attempt: &Attempt,
    used: &[String],
    previous: Option<&str>,
) -> NewRecord {
    let invocation = &attempt.invocation;
    let step = invocation.step_name.as_str();
    let activity = invocation.activity_id();
    let agent = invocation
        .agent_instance
        .as_deref()
        .map(ProvAgent::software)
        .unwrap_or_else(ProvAgent::orchestrator);

    let mut record = NewRecord::new(kind)
        .for_step(step)
        .with_activity(Activity {
            id: activity.clone(),
            label: format!("{} via {}", step, invocation.capability),
            attempt: Some(invocation.attempt_count),
            status: Some(label(invocation.status)),
            started_at: invocation.started_at,
            ended_at: invocation.finished_at,
        })
        .relate(&activity, RelationKind::WasAssociatedWith, &agent.id)
        .with_agent(agent);

    for entity in used {
        record = record.relate(&activity, RelationKind::Used, entity);
    }
    if let Some(previous) = previous {
        record = record.relate(&activity, RelationKind::RetryOf, previous);
    }

    match &attempt.result {
        Ok(AgentReply::Completed { output, proposals }) => {
            let output_id = output_entity(step, invocation);
            record = record
                .with_entity(
                    Entity::new(&output_id, format!("{} output", step)).with_value(output.clone()),
                )
                .relate(&output_id, RelationKind::WasGeneratedBy, &activity);

            let mut evidence = Vec::new();
            for proposal in proposals {
                let id = proposal_entity(step, &proposal.field, invocation);
                record = record
                    .with_entity(
                        Entity::new(&id, format!("proposed {}", proposal.field))
                            .with_value(proposal.value.clone()),
                    )
                    .relate(&id, RelationKind::WasGeneratedBy, &activity);
                evidence.push(format!(
                    "{} = {} ({:.2})",
                    proposal.field, proposal.value, proposal.confidence
                ));
                evidence.extend(proposal.evidence.iter().map(|e| format!("{}: {}", proposal.field, e)));
            }
            if !evidence.is_empty() {
                record = record.with_annotation(Annotation {
                    evidence,
                    ..Default::default()
                });
            }
        }
        Ok(AgentReply::NeedsInput { request, .. }) => {
            let question = format!("entity:{}:question:{}", step, invocation.invocation_id);
            record = record
                .with_entity(
                    Entity::new(&question, format!("{} question", step)).with_value(request.clone()),
                )
                .relate(&question, RelationKind::WasGeneratedBy, &activity);
        }
        Err(error) => {
            record = record.with_annotation(Annotation {
                note: Some(format!("{}: {}", label(error.class()), error)),
                ..Default::default()
            });
        }
    }

    record
}

fn output_entity(step: &str, invocation: &AgentInvocation) -> String {
    format!("entity:{}:output:{}", step, invocation.invocation_id)
}

fn proposal_entity(step: &str, field: &str, invocation: &AgentInvocation) -> String {
    format!("entity:{}:proposal:{}:{}", step, field, invocation.invocation_id)
}

/// Wire name of a serde enum value
fn label<T: Serialize>(value: T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Mark unfinished steps as abandoned
/// `name=status` for every step that has not succeeded or been skipped
fn unfinished_steps(session: &ConversionSession) -> Vec<String> {
    session
        .steps
        .iter()
        .filter(|(_, state)| !state.status.is_done())
        .map(|(name, state)| format!("{}={}", name, label(state.status)))
        .collect()
}

fn abandon_steps(session: &mut ConversionSession) {
    for state in session.steps.values_mut() {
        if matches!(
            state.status,
            StepStatus::Pending | StepStatus::Running | StepStatus::NeedsInput
        ) {
            state.status = StepStatus::Cancelled;
        }
    }
}

/// Check resume input against the outstanding request
fn check_input(request: &InputRequest, input: &serde_json::Value) -> Result<(), InputError> {
    if request.required.is_empty() {
        return Ok(());
    }

    let object = input.as_object().ok_or_else(|| InputError::NotAnObject {
        step: request.step_name.clone(),
    })?;

    let missing: Vec<String> = request
        .required
        .iter()
        .filter(|key| !object.contains_key(key.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(InputError::MissingKeys {
            step: request.step_name.clone(),
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(required: &[&str]) -> InputRequest {
        InputRequest {
            step_name: "metadata".into(),
            kind: InputKind::AgentQuestion {
                request: serde_json::json!({"question": "subject?"}),
            },
            required: required.iter().map(|s| s.to_string()).collect(),
            requested_at: Utc::now(),
        }
    }

    #[test]
    fn test_check_input() {
        assert!(check_input(&request(&[]), &serde_json::json!("anything")).is_ok());
        assert!(check_input(&request(&["subject_id"]), &serde_json::json!({"subject_id": "m1"})).is_ok());

        assert_eq!(
            check_input(&request(&["subject_id"]), &serde_json::json!("m1")),
            Err(InputError::NotAnObject {
                step: "metadata".into()
            })
        );
        assert_eq!(
            check_input(&request(&["subject_id", "species"]), &serde_json::json!({"species": "mouse"})),
            Err(InputError::MissingKeys {
                step: "metadata".into(),
                missing: vec!["subject_id".into()]
            })
        );
    }

    #[test]
    fn test_abandon_keeps_finished_steps() {
        let workflow = WorkflowDefinition {
            id: "wf".into(),
            description: String::new(),
            steps: vec![
                StepDefinition::new("a", "x"),
                StepDefinition::new("b", "x"),
                StepDefinition::new("c", "x"),
            ],
            timeout_seconds: 60,
            retry_policy: Default::default(),
            validation: None,
        };
        let mut session = ConversionSession::new(workflow, serde_json::Value::Null);
        session.step_mut("a").unwrap().status = StepStatus::Succeeded;
        session.step_mut("b").unwrap().status = StepStatus::Running;

        abandon_steps(&mut session);

        assert_eq!(session.step_status("a"), Some(StepStatus::Succeeded));
        assert_eq!(session.step_status("b"), Some(StepStatus::Cancelled));
        assert_eq!(session.step_status("c"), Some(StepStatus::Cancelled));
    }

    #[test]
    fn test_unfinished_steps_names_stalled_work() {
        let workflow = WorkflowDefinition {
            id: "wf".into(),
            description: String::new(),
            steps: vec![
                StepDefinition::new("a", "x"),
                StepDefinition::new("b", "x"),
                StepDefinition::new("c", "x"),
            ],
            timeout_seconds: 60,
            retry_policy: Default::default(),
            validation: None,
        };
        let mut session = ConversionSession::new(workflow, serde_json::Value::Null);
        session.step_mut("a").unwrap().status = StepStatus::Succeeded;
        session.step_mut("b").unwrap().status = StepStatus::Skipped;

        assert_eq!(unfinished_steps(&session), vec!["c=pending"]);

        session.step_mut("c").unwrap().status = StepStatus::Succeeded;
        assert!(unfinished_steps(&session).is_empty());
    }

    #[test]
    fn test_stall_is_an_internal_failure() {
        let failure = SessionFailure {
            step_name: None,
            kind: FailureKind::Internal,
            message: "No runnable steps remain: c=pending".into(),
            last_checkpoint_version: 3,
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "internal");
        assert_ne!(failure.kind, FailureKind::PermanentAgent);
        assert_eq!(label(FailureKind::ProvenanceWrite), "provenance_write");
    }

    #[test]
    fn test_label_uses_wire_names() {
        assert_eq!(label(StepStatus::NeedsInput), "needs_input");
        assert_eq!(label(crate::domain::InvocationStatus::TimedOut), "timed_out");
    }
}
