//! Conversion sessions and their state machine.
//!
//! A session is a single execution of a workflow. It is mutated only by the
//! orchestrator and persisted as immutable checkpoints.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::artifact::Artifact;
use super::validation::ValidationResult;
use super::workflow::WorkflowDefinition;

/// Opaque session token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh session id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A workflow execution session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionSession {
    pub session_id: SessionId,

    /// The workflow definition in force
    pub workflow: WorkflowDefinition,

    /// Input supplied at submission
    pub input: serde_json::Value,

    pub state: SessionState,

    /// Per-step progress (the frontier)
    pub steps: BTreeMap<String, StepState>,

    /// Outputs of succeeded steps
    pub artifacts: BTreeMap<String, Artifact>,

    /// Accepted metadata field values proposed by agents
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,

    /// Result of the final validation stage
    #[serde(default)]
    pub validation: Option<ValidationResult>,

    /// Terminating error, if any
    #[serde(default)]
    pub failure: Option<SessionFailure>,

    /// Version of the most recent checkpoint of this session
    pub checkpoint_version: u64,

    /// Active (driving) time consumed, counted against the workflow timeout
    #[serde(default)]
    pub active_ms: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Deadline for supplying input while suspended
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ConversionSession {
    /// Create a session in the `analyzing` state with every step pending
    pub fn new(workflow: WorkflowDefinition, input: serde_json::Value) -> Self {
        let now = Utc::now();
        let steps = workflow
            .steps
            .iter()
            .map(|s| (s.name.clone(), StepState::default()))
            .collect();

        Self {
            session_id: SessionId::new(),
            workflow,
            input,
            state: SessionState::Analyzing,
            steps,
            artifacts: BTreeMap::new(),
            fields: BTreeMap::new(),
            validation: None,
            failure: None,
            checkpoint_version: 0,
            active_ms: 0,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    /// Move to a new state, enforcing the state machine
    pub fn transition(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Status of a single step
    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.steps.get(name).map(|s| s.status)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepState> {
        self.steps.get_mut(name)
    }

    /// Every step has succeeded or been skipped
    pub fn all_steps_done(&self) -> bool {
        self.steps.values().all(|s| s.status.is_done())
    }

    /// Steps currently dispatched to an agent
    pub fn running_steps(&self) -> Vec<String> {
        self.steps_with_status(StepStatus::Running)
    }

    pub fn steps_with_status(&self, status: StepStatus) -> Vec<String> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The outstanding input request, lowest step name first
    pub fn pending_input(&self) -> Option<&InputRequest> {
        self.steps
            .values()
            .filter(|s| s.status == StepStatus::NeedsInput)
            .find_map(|s| s.input_request.as_ref())
    }

    /// Check if the suspension deadline has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Suspended
            && self.expires_at.map(|e| e <= now).unwrap_or(false)
    }

    /// Compact view for callers
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            workflow_id: self.workflow.id.clone(),
            state: self.state,
            steps: self
                .steps
                .iter()
                .map(|(name, s)| (name.clone(), s.status))
                .collect(),
            pending_input: self.pending_input().cloned(),
            failure: self.failure.clone(),
            validation: self.validation.clone(),
            checkpoint_version: self.checkpoint_version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
        }
    }
}

/// State of a conversion session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Workflow accepted, session being prepared
    Analyzing,

    /// Steps are being dispatched
    Running,

    /// Waiting for external input
    Suspended,

    /// All steps succeeded
    Completed,

    /// Terminated by an error
    Failed,

    /// Terminated by request or watchdog
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed edges of the session state machine
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Analyzing, Running)
                | (Analyzing, Cancelled)
                | (Running, Suspended)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Suspended, Running)
                | (Suspended, Failed)
                | (Suspended, Cancelled)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Analyzing => "analyzing",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("Invalid session transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Progress of a single step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,

    /// Total attempts across all dispatches of this step
    pub attempts: u32,

    #[serde(default)]
    pub last_error: Option<String>,

    /// Provenance activity of the most recent attempt
    #[serde(default)]
    pub last_activity: Option<String>,

    /// Question the agent asked when it returned `needs_input`
    #[serde(default)]
    pub input_request: Option<InputRequest>,

    /// Answer supplied through `resume`, forwarded on the next dispatch
    #[serde(default)]
    pub supplied_input: Option<serde_json::Value>,

    /// Provenance entity of the supplied answer
    #[serde(default)]
    pub supplied_entity: Option<String>,

    /// Further conflict decisions waiting behind `input_request`
    #[serde(default)]
    pub queued_requests: Vec<InputRequest>,
}

/// Status of a step within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet dispatched
    Pending,

    /// Dispatched to an agent
    Running,

    /// Completed successfully
    Succeeded,

    /// Failed (retries exhausted or permanent error)
    Failed,

    /// Condition evaluated false
    Skipped,

    /// Waiting for external input
    NeedsInput,

    /// Abandoned because the session was cancelled
    Cancelled,
}

impl StepStatus {
    /// Satisfies dependents
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// A request for input returned to the caller on suspension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    /// Step that is waiting
    pub step_name: String,

    pub kind: InputKind,

    /// Keys the supplied JSON object must contain
    #[serde(default)]
    pub required: Vec<String>,

    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum InputKind {
    /// The agent asked a question
    AgentQuestion { request: serde_json::Value },

    /// Two equally-confident proposals need a human decision
    ConflictResolution {
        field: String,
        conflict_record: String,
        candidates: Vec<FieldValue>,
    },
}

/// An accepted (or candidate) value for a metadata field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: serde_json::Value,
    pub confidence: f64,

    /// Step that proposed the value
    pub source_step: String,

    /// Provenance entity for the value
    pub entity_id: String,
}

/// User-visible failure description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub step_name: Option<String>,
    pub kind: FailureKind,
    pub message: String,

    /// Last checkpoint written before the failure was recorded
    pub last_checkpoint_version: u64,
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_name {
            Some(step) => write!(
                f,
                "{:?} at step '{}' (checkpoint v{}): {}",
                self.kind, step, self.last_checkpoint_version, self.message
            ),
            None => write!(
                f,
                "{:?} (checkpoint v{}): {}",
                self.kind, self.last_checkpoint_version, self.message
            ),
        }
    }
}

/// Error classification surfaced with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    TransientAgent,
    PermanentAgent,
    CompensationRequired,
    CircuitOpen,
    CheckpointCorruption,
    SuspendedInputTimeout,
    SessionTimeout,

    /// A provenance record could not be persisted
    ProvenanceWrite,

    /// The scheduler reached a state it cannot make progress from
    Internal,
}

/// Summary returned by `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub workflow_id: String,
    pub state: SessionState,
    pub steps: BTreeMap<String, StepStatus>,
    pub pending_input: Option<InputRequest>,
    pub failure: Option<SessionFailure>,
    pub validation: Option<ValidationResult>,
    pub checkpoint_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::workflow::StepDefinition;

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".into(),
            description: String::new(),
            steps: vec![
                StepDefinition::new("a", "detect"),
                StepDefinition::new("b", "convert").after(["a"]),
            ],
            timeout_seconds: 60,
            retry_policy: Default::default(),
            validation: None,
        }
    }

    #[test]
    fn test_session_creation() {
        let session = ConversionSession::new(workflow(), serde_json::json!({"path": "/data"}));

        assert_eq!(session.state, SessionState::Analyzing);
        assert_eq!(session.steps.len(), 2);
        assert_eq!(session.step_status("a"), Some(StepStatus::Pending));
        assert!(!session.all_steps_done());
    }

    #[test]
    fn test_state_machine() {
        let mut session = ConversionSession::new(workflow(), serde_json::Value::Null);

        assert!(session.transition(SessionState::Completed).is_err());
        session.transition(SessionState::Running).unwrap();
        session.transition(SessionState::Suspended).unwrap();
        session.transition(SessionState::Running).unwrap();
        session.transition(SessionState::Completed).unwrap();

        // Terminal states are final
        assert!(session.transition(SessionState::Cancelled).is_err());
        assert!(session.transition(SessionState::Running).is_err());
    }

    #[test]
    fn test_pending_input_lowest_step_first() {
        let mut session = ConversionSession::new(workflow(), serde_json::Value::Null);
        for name in ["b", "a"] {
            let step = session.step_mut(name).unwrap();
            step.status = StepStatus::NeedsInput;
            step.input_request = Some(InputRequest {
                step_name: name.into(),
                kind: InputKind::AgentQuestion {
                    request: serde_json::json!({"question": name}),
                },
                required: vec![],
                requested_at: Utc::now(),
            });
        }

        assert_eq!(session.pending_input().unwrap().step_name, "a");
    }

    #[test]
    fn test_expiry_only_applies_when_suspended() {
        let mut session = ConversionSession::new(workflow(), serde_json::Value::Null);
        let past = Utc::now() - chrono::Duration::seconds(5);
        session.expires_at = Some(past);

        assert!(!session.is_expired(Utc::now()));
        session.state = SessionState::Suspended;
        assert!(session.is_expired(Utc::now()));
    }

    #[test]
    fn test_session_id_round_trip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }
}
