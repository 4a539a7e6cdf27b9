//! Agent dispatch: instance selection, hard timeouts and retries.
//!
//! The coordinator owns the capability-keyed agent table. Each attempt picks
//! an instance from the healthiest tier in round-robin order, skipping
//! instances that are down or behind an open circuit breaker. One deadline
//! covers the whole attempt, health checks included, regardless of the
//! agent's own limits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapters::{AgentError, AgentPort, AgentReply, AgentRequest, Health};
use crate::domain::{AgentInvocation, ErrorClass, FailureKind, InvocationStatus, RetryPolicy};

use super::error_handler::{CircuitBreaker, ErrorHandler, RetryDecision};

/// Longest a single health check may take, within the attempt deadline
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a dispatch attempt did not produce a reply
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Agent '{instance}' timed out after {timeout:?}")]
    TimedOut { instance: String, timeout: Duration },

    #[error("Circuit open for every available instance of '{0}'")]
    CircuitOpen(String),

    #[error("Every instance of '{0}' reports down")]
    Unavailable(String),

    #[error("No agent registered for capability '{0}'")]
    NoAgent(String),
}

impl DispatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Agent(e) => e.class(),
            Self::TimedOut { .. } | Self::CircuitOpen(_) | Self::Unavailable(_) => {
                ErrorClass::Transient
            }
            Self::NoAgent(_) => ErrorClass::Permanent,
        }
    }

    /// Failure kind reported when this error ends a session
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::CircuitOpen(_) => FailureKind::CircuitOpen,
            Self::NoAgent(_) => FailureKind::PermanentAgent,
            other => match other.class() {
                ErrorClass::Transient => FailureKind::TransientAgent,
                ErrorClass::Permanent => FailureKind::PermanentAgent,
                ErrorClass::NeedsCompensation => FailureKind::CompensationRequired,
            },
        }
    }
}

/// Capability-keyed table of agent instances
#[derive(Default)]
pub struct AgentRegistry {
    by_capability: BTreeMap<String, Vec<Arc<dyn AgentPort>>>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance. Instance names must be unique.
    pub fn register(&mut self, agent: Arc<dyn AgentPort>) -> Result<()> {
        let duplicate = self
            .by_capability
            .values()
            .flatten()
            .any(|a| a.name() == agent.name());
        if duplicate {
            bail!("Agent instance '{}' is already registered", agent.name());
        }

        debug!(agent = %agent.name(), capability = %agent.capability(), "Registered agent");
        self.by_capability
            .entry(agent.capability().to_string())
            .or_default()
            .push(agent);
        Ok(())
    }

    pub fn with(mut self, agent: Arc<dyn AgentPort>) -> Result<Self> {
        self.register(agent)?;
        Ok(self)
    }

    pub fn instances(&self, capability: &str) -> &[Arc<dyn AgentPort>] {
        self.by_capability
            .get(capability)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        !self.instances(capability).is_empty()
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.by_capability.keys().map(String::as_str)
    }

    /// Advance and return the round-robin cursor of a capability
    fn next_cursor(&self, capability: &str) -> usize {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = cursors.entry(capability.to_string()).or_insert(0);
        let current = *cursor;
        *cursor = cursor.wrapping_add(1);
        current
    }
}

/// One attempt and what came of it
#[derive(Debug, Clone)]
pub struct Attempt {
    pub invocation: AgentInvocation,
    pub result: Result<AgentReply, DispatchError>,
}

/// Final outcome of a dispatch with retries
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The agent answered (completed or needs input)
    Replied {
        reply: AgentReply,
        invocation: AgentInvocation,
    },

    /// Retries exhausted or the error is not retryable
    Failed {
        error: DispatchError,
        invocation: AgentInvocation,
        compensate: bool,
    },

    /// Cancellation observed between attempts
    Cancelled { attempts: u32 },
}

/// Sees every attempt as soon as it finishes
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    async fn on_attempt(&self, attempt: &Attempt);
}

/// Dispatches steps to agents
pub struct AgentInvocationCoordinator {
    registry: AgentRegistry,
    errors: Arc<ErrorHandler>,
}

impl AgentInvocationCoordinator {
    pub fn new(registry: AgentRegistry, errors: Arc<ErrorHandler>) -> Self {
        Self { registry, errors }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    /// Pick an instance and reserve its breaker.
    ///
    /// Health checks run concurrently; a check that does not answer by the
    /// deadline counts as `Down`.
    async fn select(
        &self,
        capability: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(Arc<dyn AgentPort>, Arc<CircuitBreaker>), DispatchError> {
        let instances = self.registry.instances(capability);
        if instances.is_empty() {
            return Err(DispatchError::NoAgent(capability.to_string()));
        }

        let check_deadline = deadline.min(Instant::now() + HEALTH_CHECK_TIMEOUT);
        let mut checks = JoinSet::new();
        for (index, agent) in instances.iter().enumerate() {
            let agent = agent.clone();
            checks.spawn(async move {
                let health = tokio::time::timeout_at(check_deadline, agent.health_check()).await;
                (index, health)
            });
        }

        let mut healths = vec![Health::Down; instances.len()];
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((index, Ok(health))) => healths[index] = health,
                Ok((index, Err(_))) => warn!(
                    capability,
                    agent = %instances[index].name(),
                    "Health check did not answer in time, treating instance as down"
                ),
                Err(e) => warn!(capability, error = %e, "Health check task failed"),
            }
        }

        if Instant::now() >= deadline {
            return Err(DispatchError::TimedOut {
                instance: capability.to_string(),
                timeout,
            });
        }

        let mut available: Vec<_> = instances
            .iter()
            .zip(healths)
            .filter(|(_, health)| *health != Health::Down)
            .map(|(agent, health)| (health, agent.clone()))
            .collect();
        if available.is_empty() {
            return Err(DispatchError::Unavailable(capability.to_string()));
        }

        // Rotate so that equal-health instances take turns, then order by tier
        let start = self.registry.next_cursor(capability) % available.len();
        available.rotate_left(start);
        available.sort_by_key(|(health, _)| *health);

        for (health, agent) in available {
            let breaker = self.errors.breaker(agent.name());
            if breaker.try_acquire() {
                debug!(capability, agent = %agent.name(), ?health, "Selected agent instance");
                return Ok((agent, breaker));
            }
        }

        Err(DispatchError::CircuitOpen(capability.to_string()))
    }

    /// Run one attempt; `timeout` bounds selection and the call together
    pub async fn invoke(
        &self,
        capability: &str,
        request: &AgentRequest,
        timeout: Duration,
    ) -> Attempt {
        let mut invocation = AgentInvocation::new(
            request.session_id,
            &request.step_name,
            capability,
            request.attempt,
            serde_json::to_value(request).unwrap_or_default(),
        );

        let deadline = Instant::now() + timeout;
        let (agent, breaker) = match self.select(capability, deadline, timeout).await {
            Ok(selected) => selected,
            Err(error) => {
                let status = match error {
                    DispatchError::TimedOut { .. } => InvocationStatus::TimedOut,
                    _ => InvocationStatus::Failed,
                };
                invocation.finish(status, None, Some((error.to_string(), error.class())));
                return Attempt {
                    invocation,
                    result: Err(error),
                };
            }
        };

        invocation.start(agent.name());
        let result = match tokio::time::timeout_at(deadline, agent.invoke(request)).await {
            Ok(Ok(reply)) => {
                breaker.record_success();
                let status = match reply {
                    AgentReply::Completed { .. } => InvocationStatus::Succeeded,
                    AgentReply::NeedsInput { .. } => InvocationStatus::NeedsInput,
                };
                invocation.finish(status, serde_json::to_value(&reply).ok(), None);
                Ok(reply)
            }
            Ok(Err(error)) => {
                // Only transient failures say anything about agent health
                if error.class() == ErrorClass::Transient {
                    breaker.record_failure();
                } else {
                    breaker.record_success();
                }
                invocation.finish(
                    InvocationStatus::Failed,
                    None,
                    Some((error.to_string(), error.class())),
                );
                Err(DispatchError::Agent(error))
            }
            Err(_) => {
                breaker.record_failure();
                let error = DispatchError::TimedOut {
                    instance: agent.name().to_string(),
                    timeout,
                };
                invocation.finish(
                    InvocationStatus::TimedOut,
                    None,
                    Some((error.to_string(), ErrorClass::Transient)),
                );
                Err(error)
            }
        };

        Attempt { invocation, result }
    }

    /// Dispatch a step, retrying per policy until it replies, fails for good
    /// or cancellation is observed between attempts
    pub async fn dispatch(
        &self,
        capability: &str,
        mut request: AgentRequest,
        timeout: Duration,
        policy: &RetryPolicy,
        cancel: &AtomicBool,
        observer: &dyn AttemptObserver,
    ) -> DispatchOutcome {
        let mut attempt_number = 0u32;

        loop {
            if cancel.load(Ordering::SeqCst) {
                return DispatchOutcome::Cancelled {
                    attempts: attempt_number,
                };
            }

            attempt_number += 1;
            request.attempt = attempt_number;

            let attempt = self.invoke(capability, &request, timeout).await;
            observer.on_attempt(&attempt).await;

            let Attempt { invocation, result } = attempt;
            let error = match result {
                Ok(reply) => return DispatchOutcome::Replied { reply, invocation },
                Err(error) => error,
            };

            match self.errors.decide(error.class(), attempt_number, policy) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        step = %request.step_name,
                        capability,
                        attempt = attempt_number,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Fail => {
                    info!(
                        step = %request.step_name,
                        attempt = attempt_number,
                        error = %error,
                        "Giving up on step"
                    );
                    return DispatchOutcome::Failed {
                        error,
                        invocation,
                        compensate: false,
                    };
                }
                RetryDecision::Compensate => {
                    return DispatchOutcome::Failed {
                        error,
                        invocation,
                        compensate: true,
                    }
                }
            }
        }
    }
}
