//! Subprocess adapters for agents and validators.
//!
//! The request is written to the child's stdin as JSON and the reply is read
//! from stdout. Exit codes carry the error class for agents:
//! - 0: reply on stdout
//! - 2: input rejected (permanent)
//! - 3: failed with partial side effects (needs compensation)
//! - anything else: transient

use std::process::{Output, Stdio};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{AgentError, AgentPort, AgentReply, AgentRequest, Health, ValidatorPort};
use crate::domain::ValidatorOutcome;

const EXIT_PERMANENT: i32 = 2;
const EXIT_NEEDS_COMPENSATION: i32 = 3;

/// An agent instance backed by an external command
#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    capability: String,
    command: Vec<String>,
    health_command: Option<Vec<String>>,
}

impl CommandAgent {
    /// Create an agent running `command` (program followed by arguments)
    pub fn new(
        name: impl Into<String>,
        capability: impl Into<String>,
        command: Vec<String>,
    ) -> Result<Self> {
        let name = name.into();
        if command.is_empty() {
            anyhow::bail!("Agent '{}' has an empty command", name);
        }

        Ok(Self {
            name,
            capability: capability.into(),
            command,
            health_command: None,
        })
    }

    /// Command whose exit code reports health (0 healthy, 1 degraded)
    pub fn with_health_command(mut self, command: Vec<String>) -> Self {
        self.health_command = Some(command).filter(|c| !c.is_empty());
        self
    }
}

/// Spawn a command, feed it stdin and collect its output.
///
/// The child is killed if the returned future is dropped, so a caller-side
/// timeout also stops the process.
async fn run_command(command: &[String], stdin: &[u8]) -> std::io::Result<Output> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut pipe) = child.stdin.take() {
        // A child may exit without reading its input
        if let Err(e) = pipe.write_all(stdin).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e);
            }
        }
        // Drop stdin to signal EOF
    }

    child.wait_with_output().await
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl AgentPort for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> &str {
        &self.capability
    }

    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply, AgentError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| AgentError::Permanent(format!("Failed to encode request: {}", e)))?;

        let output = run_command(&self.command, &payload).await.map_err(|e| {
            AgentError::Permanent(format!("Failed to spawn agent '{}': {}", self.name, e))
        })?;

        match output.status.code() {
            Some(0) => serde_json::from_slice(&output.stdout).map_err(|e| {
                AgentError::Permanent(format!("Agent '{}' returned an invalid reply: {}", self.name, e))
            }),
            Some(EXIT_PERMANENT) => Err(AgentError::Permanent(stderr_text(&output))),
            Some(EXIT_NEEDS_COMPENSATION) => {
                Err(AgentError::NeedsCompensation(stderr_text(&output)))
            }
            Some(code) => Err(AgentError::Transient(format!(
                "Agent '{}' exited with code {}: {}",
                self.name,
                code,
                stderr_text(&output)
            ))),
            None => Err(AgentError::Transient(format!(
                "Agent '{}' was terminated by a signal",
                self.name
            ))),
        }
    }

    async fn health_check(&self) -> Health {
        let Some(command) = &self.health_command else {
            return Health::Healthy;
        };

        match run_command(command, &[]).await {
            Ok(output) => match output.status.code() {
                Some(0) => Health::Healthy,
                Some(1) => Health::Degraded,
                _ => Health::Down,
            },
            Err(e) => {
                debug!(agent = %self.name, error = %e, "Health command failed to run");
                Health::Down
            }
        }
    }
}

/// A validator backed by an external command.
///
/// The artifact JSON is written to stdin; stdout must be a
/// `ValidatorOutcome`.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    name: String,
    command: Vec<String>,
}

impl CommandValidator {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Result<Self> {
        let name = name.into();
        if command.is_empty() {
            anyhow::bail!("Validator '{}' has an empty command", name);
        }
        Ok(Self { name, command })
    }
}

#[async_trait]
impl ValidatorPort for CommandValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, artifact: &serde_json::Value) -> Result<ValidatorOutcome> {
        let payload = serde_json::to_vec(artifact).context("Failed to encode artifact")?;

        let output = run_command(&self.command, &payload)
            .await
            .with_context(|| format!("Failed to spawn validator '{}'", self.name))?;

        if !output.status.success() {
            anyhow::bail!(
                "Validator '{}' failed with exit code {}: {}",
                self.name,
                output.status.code().unwrap_or(-1),
                stderr_text(&output)
            );
        }

        let mut outcome: ValidatorOutcome = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Validator '{}' returned invalid output", self.name))?;
        outcome.validator = self.name.clone();
        Ok(outcome)
    }
}
