//! Core orchestration logic.
//!
//! This module contains:
//! - Dag: Workflow validation and ready-step computation
//! - ErrorHandler: Retry decisions and per-instance circuit breakers
//! - Coordinator: Agent selection and invocation with retries
//! - State: Versioned, checksummed session checkpoints
//! - Provenance: Append-only provenance log and export
//! - Aggregator: Ensemble validation
//! - Orchestrator: Main execution engine

pub mod aggregator;
pub mod coordinator;
pub mod dag;
pub mod error_handler;
pub mod orchestrator;
pub mod provenance;
pub mod state;

// Re-export commonly used types
pub use aggregator::{ValidationAggregator, ValidatorRegistry, DEFAULT_VALIDATOR_TIMEOUT};
pub use coordinator::{AgentInvocationCoordinator, AgentRegistry, DispatchError};
pub use dag::{DagError, ExecutionPlan};
pub use error_handler::{CircuitBreakerConfig, CircuitState, ErrorHandler, RetryDecision};
pub use orchestrator::{InputError, Orchestrator, OrchestratorBuilder, OrchestratorSettings};
pub use provenance::{ExportFormat, ProvenanceQuery, ProvenanceTracker};
pub use state::{CheckpointError, RetentionPolicy, StateManager};
