//! Command-line interface for convflow.
//!
//! Provides commands for submitting workflows, checking status, answering
//! suspended sessions, exporting provenance and housekeeping. Each command
//! that drives a session waits for it to settle before printing.

use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config;
use crate::core::{ExportFormat, Orchestrator, RetentionPolicy};
use crate::domain::{InputKind, SessionId, SessionState, SessionSummary, WorkflowDefinition};

/// convflow - Checkpointed multi-agent conversion orchestrator
#[derive(Parser, Debug)]
#[command(name = "convflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a workflow and drive it until it settles
    Submit {
        /// Workflow definition (YAML)
        workflow: PathBuf,

        /// Input JSON file (reads from stdin if piped)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Check the status of a session
    Status {
        /// Session ID (UUID)
        session_id: String,
    },

    /// Supply input to a suspended session and continue it
    Resume {
        /// Session ID to resume
        session_id: String,

        /// Input JSON file
        #[arg(short, long, conflicts_with = "value")]
        input: Option<PathBuf>,

        /// Input as an inline JSON value
        #[arg(long)]
        value: Option<String>,
    },

    /// Cancel a session
    Cancel {
        /// Session ID to cancel
        session_id: String,
    },

    /// Export the provenance graph of a session
    Provenance {
        /// Session ID
        session_id: String,

        /// Output format: json, jsonl or turtle
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// List recent sessions
    Sessions {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Delete superseded checkpoints of a session
    Prune {
        /// Session ID
        session_id: String,

        /// Keep the newest N checkpoints
        #[arg(long)]
        keep_last: Option<usize>,

        /// Delete checkpoints older than this many hours
        #[arg(long)]
        older_than_hours: Option<i64>,
    },

    /// Fail suspended sessions whose input deadline has passed
    Sweep,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Submit { workflow, input } => submit(&workflow, input).await,
            Commands::Status { session_id } => show_status(&session_id).await,
            Commands::Resume {
                session_id,
                input,
                value,
            } => resume(&session_id, input, value).await,
            Commands::Cancel { session_id } => cancel(&session_id).await,
            Commands::Provenance { session_id, format } => {
                export_provenance(&session_id, &format).await
            }
            Commands::Sessions { limit } => list_sessions(limit).await,
            Commands::Prune {
                session_id,
                keep_last,
                older_than_hours,
            } => prune(&session_id, keep_last, older_than_hours).await,
            Commands::Sweep => sweep().await,
            Commands::Config => show_config().await,
        }
    }
}

async fn orchestrator() -> Result<Orchestrator> {
    config::config()?.build_orchestrator().await
}

fn parse_session_id(s: &str) -> Result<SessionId> {
    s.parse()
        .with_context(|| format!("Invalid session ID: {}", s))
}

fn read_json_file(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Input file is not valid JSON: {}", path.display()))
}

/// Submit a workflow and wait for it to settle
async fn submit(workflow_path: &Path, input_file: Option<PathBuf>) -> Result<()> {
    let workflow = WorkflowDefinition::from_file(workflow_path)?;

    let input = if let Some(path) = input_file {
        read_json_file(&path)?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        if buffer.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&buffer).context("Stdin is not valid JSON")?
        }
    } else {
        serde_json::json!({})
    };

    let orchestrator = orchestrator().await?;
    let session_id = orchestrator.submit(workflow, input).await?;
    eprintln!("[Session {} submitted]", session_id);

    let summary = orchestrator.wait(session_id).await?;
    report(&summary)
}

async fn show_status(session_id: &str) -> Result<()> {
    let session_id = parse_session_id(session_id)?;
    let summary = orchestrator().await?.status(session_id).await?;
    print_summary(&summary);
    Ok(())
}

async fn resume(session_id: &str, input_file: Option<PathBuf>, value: Option<String>) -> Result<()> {
    let session_id = parse_session_id(session_id)?;

    let input = match (input_file, value) {
        (Some(path), _) => read_json_file(&path)?,
        (None, Some(value)) => {
            serde_json::from_str(&value).context("--value is not valid JSON")?
        }
        (None, None) => serde_json::Value::Null,
    };

    let orchestrator = orchestrator().await?;
    orchestrator.resume(session_id, input).await?;

    let summary = orchestrator.wait(session_id).await?;
    report(&summary)
}

async fn cancel(session_id: &str) -> Result<()> {
    let session_id = parse_session_id(session_id)?;
    let summary = orchestrator().await?.cancel(session_id).await?;
    print_summary(&summary);
    Ok(())
}

async fn export_provenance(session_id: &str, format: &str) -> Result<()> {
    let session_id = parse_session_id(session_id)?;
    let format: ExportFormat = format.parse()?;

    let output = orchestrator().await?.provenance(session_id, format).await?;
    print!("{}", output);
    Ok(())
}

async fn list_sessions(limit: usize) -> Result<()> {
    let sessions = orchestrator().await?.list_sessions().await?;

    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<11} {:<25}",
        "SESSION ID", "WORKFLOW", "STATE", "CREATED"
    );
    println!("{}", "-".repeat(100));

    for summary in sessions.into_iter().take(limit) {
        println!(
            "{:<38} {:<24} {:<11} {:<25}",
            summary.session_id,
            summary.workflow_id,
            summary.state.to_string(),
            summary.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}

async fn prune(
    session_id: &str,
    keep_last: Option<usize>,
    older_than_hours: Option<i64>,
) -> Result<()> {
    let session_id = parse_session_id(session_id)?;

    let mut policy = config::config()?.retention.clone();
    if keep_last.is_some() || older_than_hours.is_some() {
        policy = RetentionPolicy {
            keep_last,
            older_than: older_than_hours.map(chrono::Duration::hours),
        };
    }
    if policy == RetentionPolicy::default() {
        anyhow::bail!("No retention policy given. Use --keep-last or --older-than-hours");
    }

    let deleted = orchestrator()
        .await?
        .prune_checkpoints(session_id, &policy)
        .await?;
    println!("Deleted {} checkpoint(s): {:?}", deleted.len(), deleted);
    Ok(())
}

async fn sweep() -> Result<()> {
    let expired = orchestrator().await?.sweep_expired().await?;
    if expired.is_empty() {
        println!("No expired sessions");
    }
    for session_id in expired {
        println!("Expired: {}", session_id);
    }
    Ok(())
}

/// Print a summary and exit non-zero on failure
fn report(summary: &SessionSummary) -> Result<()> {
    print_summary(summary);

    match summary.state {
        SessionState::Completed => {
            eprintln!("\n[Session {} completed]", summary.session_id);
        }
        SessionState::Suspended => {
            eprintln!(
                "\n[Session {} suspended; answer with: convflow resume {} --value '<json>']",
                summary.session_id, summary.session_id
            );
        }
        SessionState::Failed | SessionState::Cancelled => {
            eprintln!("\n[Session {} {}]", summary.session_id, summary.state);
            std::process::exit(1);
        }
        _ => {
            eprintln!("\n[Session {} in state: {}]", summary.session_id, summary.state);
        }
    }

    Ok(())
}

fn print_summary(summary: &SessionSummary) {
    println!("Session ID: {}", summary.session_id);
    println!("Workflow: {}", summary.workflow_id);
    println!("State: {}", summary.state);
    println!("Checkpoint: v{}", summary.checkpoint_version);
    println!("Created: {}", summary.created_at);
    println!("Updated: {}", summary.updated_at);
    if let Some(expires) = summary.expires_at {
        println!("Input due by: {}", expires);
    }

    println!("\nSteps:");
    for (step, status) in &summary.steps {
        println!("  {}: {:?}", step, status);
    }

    if let Some(request) = &summary.pending_input {
        println!("\nWaiting for input at step '{}':", request.step_name);
        match &request.kind {
            InputKind::AgentQuestion { request } => {
                println!("  Question: {}", request);
            }
            InputKind::ConflictResolution {
                field, candidates, ..
            } => {
                println!("  Conflicting values for '{}':", field);
                for candidate in candidates {
                    println!(
                        "    {} (confidence {:.2}, from {})",
                        candidate.value, candidate.confidence, candidate.source_step
                    );
                }
            }
        }
        if !request.required.is_empty() {
            println!("  Required keys: {}", request.required.join(", "));
        }
    }

    if let Some(failure) = &summary.failure {
        println!("\nFailure: {}", failure);
    }

    if let Some(validation) = &summary.validation {
        println!(
            "\nValidation: {:?} (score {:.2}, {} issue(s))",
            validation.overall_status,
            validation.composite_score,
            validation.issues.len()
        );
        for issue in &validation.issues {
            println!(
                "  [{:?}] {} {}: {}",
                issue.severity, issue.location, issue.rule_id, issue.message
            );
        }
    }
}

async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("convflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:  {}", cfg.home.display());
    println!("  State: {}", cfg.state_dir().display());
    println!();
    println!("Agents:");
    if cfg.agents.is_empty() {
        println!("  (none)");
    }
    for (capability, instances) in &cfg.agents {
        println!("  {}: {} instance(s)", capability, instances.len());
    }
    println!();
    println!("Validators:");
    if cfg.validators.is_empty() {
        println!("  (none)");
    }
    for (name, validator) in &cfg.validators {
        println!("  {}: {}", name, validator.command.join(" "));
    }
    println!();
    println!("Orchestrator:");
    println!("  Max parallel steps:   {}", cfg.orchestrator.max_parallel_steps);
    println!(
        "  Default step timeout: {}s",
        cfg.orchestrator.default_step_timeout.as_secs()
    );
    println!(
        "  Suspension TTL:       {}h",
        cfg.orchestrator.suspension_ttl.num_hours()
    );
    println!();
    println!("Circuit breaker:");
    println!("  Failure threshold: {}", cfg.circuit_breaker.failure_threshold);
    println!("  Window:            {}ms", cfg.circuit_breaker.window_ms);
    println!("  Cooldown:          {}ms", cfg.circuit_breaker.cooldown_ms);
    println!("  Half-open probes:  {}", cfg.circuit_breaker.half_open_max_probes);

    Ok(())
}
