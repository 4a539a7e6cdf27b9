//! Artifacts produced by workflow steps.
//!
//! Artifacts are the outputs of steps that are handed to dependent steps
//! and carried inside checkpoints so a session can resume without re-running
//! completed work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An artifact produced by a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Name of the step that produced this artifact
    pub step_name: String,

    /// Output returned by the agent
    pub content: serde_json::Value,

    /// Provenance entity that represents this output
    pub entity_id: String,

    /// SHA256 of the serialized content
    pub content_sha256: String,

    /// When the artifact was created
    pub created_at: DateTime<Utc>,

    /// Size in bytes of the serialized content
    pub size_bytes: u64,
}

impl Artifact {
    /// Create a new artifact
    pub fn new(step_name: String, content: serde_json::Value, entity_id: String) -> Self {
        let serialized = content.to_string();
        Self {
            step_name,
            content_sha256: hex::encode(Sha256::digest(serialized.as_bytes())),
            size_bytes: serialized.len() as u64,
            content,
            entity_id,
            created_at: Utc::now(),
        }
    }
}
