//! convflow - Checkpointed DAG orchestrator for multi-agent conversion
//!
//! Executes a workflow of agent invocations as a DAG, persisting resumable
//! checkpoints and an immutable provenance record of every decision.
//!
//! # Architecture
//!
//! - Independent steps run concurrently; each outcome is checkpointed
//! - Failures are retried with backoff behind per-instance circuit breakers
//! - A step that needs input suspends the session until `resume`
//! - Every attempt, conflict and validation is a PROV-style record
//!
//! # Modules
//!
//! - `adapters`: Ports to agents, validators and storage
//! - `core`: Orchestration logic (Dag, Coordinator, State, Provenance)
//! - `domain`: Data structures (Workflow, Session, Invocation, Provenance)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Submit a workflow
//! convflow submit workflows/spikeglx.yaml --input input.json
//!
//! # Answer a suspended session
//! convflow resume <session-id> --value '{"subject_id": "mouse-1"}'
//!
//! # Export provenance
//! convflow provenance <session-id> --format turtle
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{AgentPort, FileStorage, MemoryStorage, StoragePort, ValidatorPort};
pub use core::{ExportFormat, Orchestrator, OrchestratorSettings};
pub use domain::{
    ConversionSession, SessionId, SessionState, SessionSummary, WorkflowDefinition,
};
