//! Agent invocation records.
//!
//! One record exists per attempt. A record's terminal status is set once and
//! never changes afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::SessionId;

/// A single attempt to run a step on an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub invocation_id: Uuid,
    pub session_id: SessionId,
    pub step_name: String,
    pub capability: String,

    /// Agent instance that handled the attempt (None if it never reached one)
    pub agent_instance: Option<String>,

    pub status: InvocationStatus,

    /// 1-indexed attempt number within the step
    pub attempt_count: u32,

    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,

    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl AgentInvocation {
    /// Create a pending invocation
    pub fn new(
        session_id: SessionId,
        step_name: impl Into<String>,
        capability: impl Into<String>,
        attempt_count: u32,
        request: serde_json::Value,
    ) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            session_id,
            step_name: step_name.into(),
            capability: capability.into(),
            agent_instance: None,
            status: InvocationStatus::Pending,
            attempt_count,
            request,
            response: None,
            error: None,
            error_class: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Mark as dispatched to an instance
    pub fn start(&mut self, instance: impl Into<String>) {
        if self.status == InvocationStatus::Pending {
            self.status = InvocationStatus::Running;
            self.agent_instance = Some(instance.into());
            self.started_at = Utc::now();
        }
    }

    /// Set the terminal status. Returns false if a terminal status was
    /// already recorded, in which case nothing changes.
    pub fn finish(
        &mut self,
        status: InvocationStatus,
        response: Option<serde_json::Value>,
        error: Option<(String, ErrorClass)>,
    ) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }

        let now = Utc::now();
        self.status = status;
        self.response = response;
        if let Some((message, class)) = error {
            self.error = Some(message);
            self.error_class = Some(class);
        }
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.finished_at = Some(now);
        true
    }

    /// Provenance activity id for this attempt
    pub fn activity_id(&self) -> String {
        format!("activity:{}", self.invocation_id)
    }
}

/// Status of an invocation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    NeedsInput,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// How an error should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retry per policy
    Transient,

    /// Fail immediately
    Permanent,

    /// Run the step's compensating action, then fail
    NeedsCompensation,
}
