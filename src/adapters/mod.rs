//! Ports to external collaborators.
//!
//! The orchestrator core talks to agents, validators and storage only
//! through the traits in this module:
//! - `AgentPort`: runs a step for a capability
//! - `ValidatorPort`: checks a finished artifact
//! - `StoragePort`: durable key/value bytes
//!
//! Concrete implementations shipped with the crate are the subprocess
//! adapters in `command` and the stores in `storage`.

pub mod command;
pub mod storage;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ErrorClass, SessionId, ValidatorOutcome};

pub use command::{CommandAgent, CommandValidator};
pub use storage::{FileStorage, MemoryStorage};

/// Everything an agent needs to execute one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub session_id: SessionId,
    pub step_name: String,
    pub capability: String,

    /// 1-indexed attempt within the current dispatch
    pub attempt: u32,

    /// Input supplied when the session was submitted
    pub input: serde_json::Value,

    /// Outputs of the step's predecessors, keyed by step name
    #[serde(default)]
    pub upstream: std::collections::BTreeMap<String, serde_json::Value>,

    /// Static step parameters from the workflow definition
    #[serde(default)]
    pub params: serde_json::Value,

    /// Answer to a question this step asked earlier
    #[serde(default)]
    pub supplied_input: Option<serde_json::Value>,
}

/// What an agent returns on success
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentReply {
    /// The step finished
    Completed {
        output: serde_json::Value,

        /// Metadata values the agent proposes, with confidence
        #[serde(default)]
        proposals: Vec<FieldProposal>,
    },

    /// The step cannot continue without external input
    NeedsInput {
        request: serde_json::Value,

        /// Keys the answer must contain
        #[serde(default)]
        required: Vec<String>,
    },
}

impl AgentReply {
    /// Completed reply with no proposals
    pub fn output(output: serde_json::Value) -> Self {
        Self::Completed {
            output,
            proposals: Vec::new(),
        }
    }
}

/// A proposed value for a metadata field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldProposal {
    pub field: String,
    pub value: serde_json::Value,
    pub confidence: f64,

    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Agent health as reported by `health_check`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Down,
}

/// Errors an agent may report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("Transient agent error: {0}")]
    Transient(String),

    #[error("Agent rejected input: {0}")]
    Permanent(String),

    #[error("Agent failed with partial side effects: {0}")]
    NeedsCompensation(String),
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::Permanent(_) => ErrorClass::Permanent,
            Self::NeedsCompensation(_) => ErrorClass::NeedsCompensation,
        }
    }
}

/// Port for external agents
#[async_trait]
pub trait AgentPort: Send + Sync {
    /// Instance name (unique across the registry)
    fn name(&self) -> &str;

    /// Capability this instance serves
    fn capability(&self) -> &str;

    /// Execute a step
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply, AgentError>;

    /// Report current health
    async fn health_check(&self) -> Health;
}

/// Port for external validators
#[async_trait]
pub trait ValidatorPort: Send + Sync {
    fn name(&self) -> &str;

    /// Validate a finished artifact
    async fn validate(&self, artifact: &serde_json::Value) -> Result<ValidatorOutcome>;
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O error for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Port for durable key/value storage.
///
/// Keys are `/`-separated relative paths. Writes are atomic: a reader sees
/// either the previous value or the complete new one.
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Write a value, replacing any existing one
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Read a value
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Write only if the key does not exist. Returns false if it did.
    async fn put_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<bool, StorageError>;

    /// All keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Remove a key (missing keys are not an error)
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Reject keys that could escape the store's namespace
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == ".." || seg.starts_with(".tmp"));

    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
