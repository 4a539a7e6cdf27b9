//! Versioned, integrity-checked session checkpoints.
//!
//! Each checkpoint is an immutable object at
//! `sessions/{session_id}/checkpoints/{version:020}.ckpt` holding the JSON
//! snapshot followed by a trailer line:
//!
//! ```text
//! {"session_id":"...","version":3,...}
//! --convflow-checkpoint sha256=<hex> len=<bytes>
//! ```
//!
//! A checkpoint whose trailer is missing or does not match its body is
//! treated as corrupt, and loading falls back to the next-older version.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapters::{StorageError, StoragePort};
use crate::domain::{ConversionSession, SessionId};

const TRAILER_PREFIX: &str = "--convflow-checkpoint";

/// Immutable snapshot of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: SessionId,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub session: ConversionSession,
}

/// Handle to a written checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub session_id: SessionId,
    pub version: u64,
    pub key: String,
    pub size_bytes: usize,
}

/// Result of loading the newest valid checkpoint
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub checkpoint: Checkpoint,

    /// Newer versions that failed the integrity check, newest first
    pub skipped_corrupt: Vec<u64>,
}

impl LoadedCheckpoint {
    /// Highest version present in storage, valid or not
    pub fn highest_version(&self) -> u64 {
        self.skipped_corrupt
            .iter()
            .copied()
            .chain(std::iter::once(self.checkpoint.version))
            .max()
            .unwrap_or(self.checkpoint.version)
    }
}

/// Which superseded checkpoints to delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep the newest N checkpoints
    pub keep_last: Option<usize>,

    /// Delete checkpoints created before now minus this
    pub older_than: Option<chrono::Duration>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint found for session {0}")]
    NotFound(SessionId),

    #[error("Checkpoint '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Session {session_id} has no valid checkpoint (corrupt versions: {corrupt:?})")]
    NoValidCheckpoint {
        session_id: SessionId,
        corrupt: Vec<u64>,
    },

    #[error("Checkpoint version {version} of session {session_id} already exists")]
    VersionConflict { session_id: SessionId, version: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Failed to serialize checkpoint: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Saves and loads session checkpoints through a `StoragePort`
pub struct StateManager {
    storage: Arc<dyn StoragePort>,

    /// Serializes checkpoint writes per session
    write_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl StateManager {
    pub fn new(storage: Arc<dyn StoragePort>) -> Self {
        Self {
            storage,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StoragePort> {
        &self.storage
    }

    fn write_lock(&self, session_id: SessionId) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id)
            .or_default()
            .clone()
    }

    pub fn checkpoint_prefix(session_id: SessionId) -> String {
        format!("sessions/{}/checkpoints/", session_id)
    }

    pub fn checkpoint_key(session_id: SessionId, version: u64) -> String {
        format!("{}{:020}.ckpt", Self::checkpoint_prefix(session_id), version)
    }

    /// Write the next checkpoint version of a session.
    ///
    /// Bumps `checkpoint_version` on success. The version is written with
    /// `put_if_absent`, so a second writer racing on the same session gets
    /// `VersionConflict` instead of silently replacing a snapshot.
    pub async fn save_checkpoint(
        &self,
        session: &mut ConversionSession,
    ) -> Result<CheckpointRef, CheckpointError> {
        let lock = self.write_lock(session.session_id);
        let _guard = lock.lock().await;

        let version = session.checkpoint_version + 1;
        let previous_updated = session.updated_at;
        session.checkpoint_version = version;
        session.updated_at = Utc::now();

        let checkpoint = Checkpoint {
            session_id: session.session_id,
            version,
            created_at: session.updated_at,
            session: session.clone(),
        };

        let result = self.write(&checkpoint).await;
        if result.is_err() {
            session.checkpoint_version = version - 1;
            session.updated_at = previous_updated;
        }
        result
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<CheckpointRef, CheckpointError> {
        let key = Self::checkpoint_key(checkpoint.session_id, checkpoint.version);
        let bytes = encode(checkpoint)?;
        let size_bytes = bytes.len();

        if !self.storage.put_if_absent(&key, bytes).await? {
            return Err(CheckpointError::VersionConflict {
                session_id: checkpoint.session_id,
                version: checkpoint.version,
            });
        }

        debug!(
            session_id = %checkpoint.session_id,
            version = checkpoint.version,
            size_bytes,
            "Checkpoint written"
        );

        Ok(CheckpointRef {
            session_id: checkpoint.session_id,
            version: checkpoint.version,
            key,
            size_bytes,
        })
    }

    /// Checkpoint versions present in storage, ascending
    pub async fn versions(&self, session_id: SessionId) -> Result<Vec<u64>, CheckpointError> {
        let prefix = Self::checkpoint_prefix(session_id);
        let keys = self.storage.list(&prefix).await?;

        let mut versions: Vec<u64> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix)?.strip_suffix(".ckpt")?.parse().ok())
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Read and verify one checkpoint version
    pub async fn read_version(
        &self,
        session_id: SessionId,
        version: u64,
    ) -> Result<Checkpoint, CheckpointError> {
        let key = Self::checkpoint_key(session_id, version);
        let bytes = self.storage.get(&key).await?;
        let checkpoint = decode(&key, &bytes)?;

        if checkpoint.session_id != session_id || checkpoint.version != version {
            return Err(CheckpointError::Corrupt {
                key,
                reason: format!(
                    "snapshot identifies as session {} version {}",
                    checkpoint.session_id, checkpoint.version
                ),
            });
        }
        Ok(checkpoint)
    }

    /// Load the highest version that passes the integrity check
    pub async fn load_checkpoint(
        &self,
        session_id: SessionId,
    ) -> Result<LoadedCheckpoint, CheckpointError> {
        let versions = self.versions(session_id).await?;
        if versions.is_empty() {
            return Err(CheckpointError::NotFound(session_id));
        }

        let mut skipped_corrupt = Vec::new();
        for version in versions.into_iter().rev() {
            match self.read_version(session_id, version).await {
                Ok(checkpoint) => {
                    if !skipped_corrupt.is_empty() {
                        warn!(
                            session_id = %session_id,
                            version,
                            skipped = ?skipped_corrupt,
                            "Fell back to older checkpoint"
                        );
                    }
                    return Ok(LoadedCheckpoint {
                        checkpoint,
                        skipped_corrupt,
                    });
                }
                Err(CheckpointError::Corrupt { key, reason }) => {
                    warn!(key = %key, reason = %reason, "Skipping corrupt checkpoint");
                    skipped_corrupt.push(version);
                }
                // Pruned between list and get
                Err(CheckpointError::Storage(e)) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        Err(CheckpointError::NoValidCheckpoint {
            session_id,
            corrupt: skipped_corrupt,
        })
    }

    /// Delete superseded checkpoints. Returns the deleted versions.
    ///
    /// The newest valid checkpoint is always kept, whatever the policy says.
    pub async fn prune(
        &self,
        session_id: SessionId,
        policy: &RetentionPolicy,
    ) -> Result<Vec<u64>, CheckpointError> {
        if policy.keep_last.is_none() && policy.older_than.is_none() {
            return Ok(Vec::new());
        }

        let newest_valid = self.load_checkpoint(session_id).await?.checkpoint.version;
        let cutoff = policy.older_than.map(|age| Utc::now() - age);

        let lock = self.write_lock(session_id);
        let _guard = lock.lock().await;

        let versions = self.versions(session_id).await?;
        let mut deleted = Vec::new();

        // Newest first so keep_last counts from the top
        for (position, version) in versions.into_iter().rev().enumerate() {
            if version == newest_valid {
                continue;
            }

            let beyond_count = policy.keep_last.is_some_and(|n| position >= n);
            let too_old = match cutoff {
                Some(cutoff) => match self.read_version(session_id, version).await {
                    Ok(checkpoint) => checkpoint.created_at < cutoff,
                    // Age unknown; only drop corrupt snapshots older than the newest valid one
                    Err(CheckpointError::Corrupt { .. }) => version < newest_valid,
                    Err(e) => return Err(e),
                },
                None => false,
            };

            if beyond_count || too_old {
                self.storage
                    .delete(&Self::checkpoint_key(session_id, version))
                    .await?;
                deleted.push(version);
            }
        }

        deleted.sort_unstable();
        if !deleted.is_empty() {
            debug!(session_id = %session_id, deleted = ?deleted, "Pruned checkpoints");
        }
        Ok(deleted)
    }

    /// Every session with at least one stored object
    pub async fn list_sessions(&self) -> Result<Vec<SessionId>, CheckpointError> {
        let keys = self.storage.list("sessions/").await?;
        let ids: BTreeSet<SessionId> = keys
            .iter()
            .filter_map(|k| k.strip_prefix("sessions/")?.split('/').next()?.parse().ok())
            .collect();
        Ok(ids.into_iter().collect())
    }

    /// Remove every stored object of a session (checkpoints and provenance)
    pub async fn delete_session(&self, session_id: SessionId) -> Result<usize, CheckpointError> {
        let lock = self.write_lock(session_id);
        let _guard = lock.lock().await;

        let keys = self.storage.list(&format!("sessions/{}/", session_id)).await?;
        for key in &keys {
            self.storage.delete(key).await?;
        }

        self.write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
        Ok(keys.len())
    }
}

/// Serialize a checkpoint and append the integrity trailer
pub fn encode(checkpoint: &Checkpoint) -> Result<Vec<u8>, CheckpointError> {
    let mut bytes = serde_json::to_vec(checkpoint)?;
    let digest = hex::encode(Sha256::digest(&bytes));
    let trailer = format!("\n{} sha256={} len={}\n", TRAILER_PREFIX, digest, bytes.len());
    bytes.extend_from_slice(trailer.as_bytes());
    Ok(bytes)
}

/// Verify the trailer and parse a checkpoint
pub fn decode(key: &str, bytes: &[u8]) -> Result<Checkpoint, CheckpointError> {
    let corrupt = |reason: &str| CheckpointError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let text = std::str::from_utf8(bytes).map_err(|_| corrupt("not valid UTF-8"))?;
    let text = text
        .strip_suffix('\n')
        .ok_or_else(|| corrupt("missing integrity trailer"))?;
    let (body, trailer) = text
        .rsplit_once('\n')
        .ok_or_else(|| corrupt("missing integrity trailer"))?;

    let fields = trailer
        .strip_prefix(TRAILER_PREFIX)
        .ok_or_else(|| corrupt("missing integrity trailer"))?;

    let mut digest = None;
    let mut len = None;
    for field in fields.split_whitespace() {
        if let Some(value) = field.strip_prefix("sha256=") {
            digest = Some(value);
        } else if let Some(value) = field.strip_prefix("len=") {
            len = value.parse::<usize>().ok();
        }
    }

    let (Some(digest), Some(len)) = (digest, len) else {
        return Err(corrupt("malformed integrity trailer"));
    };

    if len != body.len() {
        return Err(corrupt("length mismatch"));
    }
    if hex::encode(Sha256::digest(body.as_bytes())) != digest {
        return Err(corrupt("checksum mismatch"));
    }

    serde_json::from_str(body).map_err(|e| CheckpointError::Corrupt {
        key: key.to_string(),
        reason: format!("invalid snapshot: {}", e),
    })
}
