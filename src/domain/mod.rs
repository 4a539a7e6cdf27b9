//! Domain types for the convflow orchestrator.
//!
//! This module contains the core data structures:
//! - Workflow: DAG definitions and retry policy
//! - Session: Execution state and its state machine
//! - Invocation: Per-attempt agent call records
//! - Provenance: Append-only entity/activity/agent records
//! - Validation: Validator outcomes and the aggregated result
//! - Artifact: Step outputs

pub mod artifact;
pub mod invocation;
pub mod provenance;
pub mod session;
pub mod validation;
pub mod workflow;

// Re-export commonly used types
pub use artifact::Artifact;
pub use invocation::{AgentInvocation, ErrorClass, InvocationStatus};
pub use provenance::{
    Activity, AgentKind, Annotation, Entity, NewRecord, ProvAgent, ProvenanceRecord, RecordKind,
    Relation, RelationKind,
};
pub use session::{
    ConversionSession, FailureKind, FieldValue, InputKind, InputRequest, SessionFailure,
    SessionId, SessionState, SessionSummary, StepState, StepStatus,
};
pub use validation::{
    OverallStatus, Severity, ValidationIssue, ValidationResult, ValidatorOutcome,
    ValidatorSummary,
};
pub use workflow::{RetryPolicy, StepCondition, StepDefinition, ValidationStage, WorkflowDefinition};
