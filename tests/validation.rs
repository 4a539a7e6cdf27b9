//! Validation and Provenance Export Integration Tests
//!
//! Ensemble validation at the end of a workflow and the serialized
//! provenance graph.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::*;
use convflow::domain::{
    FailureKind, OverallStatus, RecordKind, RelationKind, SessionState, Severity, StepStatus,
    ValidationIssue, ValidatorOutcome,
};
use convflow::{ExportFormat, ValidatorPort};
use serde_json::json;

fn converter() -> ScriptedAgent {
    ScriptedAgent::always("conv", "convert", json!({"nwb": "session.nwb"}))
}

#[tokio::test]
async fn test_merged_critical_issue_fails_validation() {
    let harness = Harness::new()
        .agent(converter())
        .validator(FixedValidator::new(
            "inspector",
            0.9,
            vec![ValidationIssue::new("/acquisition", "rate", Severity::Warning, "low rate")],
        ))
        .validator(FixedValidator::new(
            "schema",
            0.5,
            vec![ValidationIssue::new("/acquisition", "rate", Severity::Critical, "no rate")],
        ));
    let orchestrator = harness.orchestrator();

    let wf = with_validation(
        workflow("validated", vec![step("convert", "convert", &[])]),
        &["inspector", "schema"],
    );
    let session_id = orchestrator.submit(wf, json!({})).await.unwrap();
    let summary = settle(&orchestrator, session_id).await;

    // A failed verdict is reported, not turned into a failed session
    assert_eq!(summary.state, SessionState::Completed);
    let validation = summary.validation.unwrap();
    assert_eq!(validation.overall_status, OverallStatus::Fail);
    assert_eq!(validation.issues.len(), 1);
    assert_eq!(validation.issues[0].severity, Severity::Critical);
    assert_eq!(validation.issues[0].reported_by, vec!["inspector", "schema"]);
    assert!((validation.composite_score - 0.7).abs() < 1e-9);

    let recorded = records(&orchestrator, session_id, RecordKind::Validation, None).await;
    assert_eq!(recorded.len(), 1);
    let annotation = recorded[0].annotation.as_ref().unwrap();
    assert_eq!(annotation.method.as_deref(), Some("ensemble"));
    assert_eq!(annotation.confidence, Some(validation.composite_score));
    assert!(recorded[0].relations.iter().any(|r| {
        r.kind == RelationKind::WasDerivedFrom && r.object.starts_with("entity:convert:output:")
    }));
}

#[tokio::test]
async fn test_stage_weights_override_defaults() {
    let harness = Harness::new()
        .agent(converter())
        .validator(FixedValidator::new("inspector", 1.0, vec![]))
        .validator(FixedValidator::new("schema", 0.0, vec![]));
    let orchestrator = harness.orchestrator();

    let mut wf = with_validation(
        workflow("weighted", vec![step("convert", "convert", &[])]),
        &["inspector", "schema"],
    );
    if let Some(stage) = wf.validation.as_mut() {
        stage.weights.insert("inspector".into(), 3.0);
    }
    let session_id = orchestrator.submit(wf, json!({})).await.unwrap();
    let validation = settle(&orchestrator, session_id).await.validation.unwrap();

    assert_eq!(validation.overall_status, OverallStatus::Pass);
    assert!((validation.composite_score - 0.75).abs() < 1e-9);
}

#[tokio::test]
async fn test_warnings_only_give_warning() {
    let harness = Harness::new()
        .agent(converter())
        .validator(FixedValidator::new(
            "inspector",
            0.8,
            vec![
                ValidationIssue::new("/units", "description", Severity::Info, "missing"),
                ValidationIssue::new("/subject", "age", Severity::Warning, "no age"),
            ],
        ));
    let orchestrator = harness.orchestrator();

    let wf = with_validation(
        workflow("warned", vec![step("convert", "convert", &[])]),
        &["inspector"],
    );
    let session_id = orchestrator.submit(wf, json!({})).await.unwrap();
    let validation = settle(&orchestrator, session_id).await.validation.unwrap();

    assert_eq!(validation.overall_status, OverallStatus::Warning);
    // Sorted by location
    assert_eq!(validation.issues[0].location, "/subject");
    assert_eq!(validation.issues[1].location, "/units");
}

#[tokio::test]
async fn test_unknown_validator_rejected() {
    let harness = Harness::new().agent(converter());
    let orchestrator = harness.orchestrator();

    let wf = with_validation(
        workflow("unvalidated", vec![step("convert", "convert", &[])]),
        &["inspector"],
    );
    let err = orchestrator.submit(wf, json!({})).await.unwrap_err();
    assert!(err.to_string().contains("inspector"));
    assert_eq!(harness.get("conv").calls(), 0);
}

#[tokio::test]
async fn test_provenance_export_formats() {
    let harness = Harness::new()
        .agent(ScriptedAgent::new(
            "conv",
            "convert",
            vec![transient("busy"), completed(json!({"nwb": "session.nwb"}))],
        ))
        .validator(FixedValidator::new("inspector", 1.0, vec![]));
    let orchestrator = harness.orchestrator();

    let wf = with_validation(
        workflow("exported", vec![step("convert", "convert", &[])]),
        &["inspector"],
    );
    let session_id = orchestrator.submit(wf, json!({})).await.unwrap();
    settle(&orchestrator, session_id).await;

    let all = orchestrator
        .provenance_tracker()
        .records(session_id)
        .await
        .unwrap();

    let json_export = orchestrator
        .provenance(session_id, ExportFormat::Json)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json_export).unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), all.len());

    let jsonl = orchestrator
        .provenance(session_id, ExportFormat::Jsonl)
        .await
        .unwrap();
    let lines: Vec<&str> = jsonl.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), all.len());
    for line in lines {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }

    let turtle = orchestrator
        .provenance(session_id, ExportFormat::Turtle)
        .await
        .unwrap();
    assert!(turtle.contains("@prefix prov:"));
    assert!(turtle.contains("cf:retryOf"));
    assert!(turtle.contains("prov:wasDerivedFrom"));
}

/// Validator that never answers
struct Stalled;

#[async_trait]
impl ValidatorPort for Stalled {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn validate(&self, _artifact: &serde_json::Value) -> Result<ValidatorOutcome> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!("validator woke up")
    }
}

#[tokio::test]
async fn test_validation_stage_counts_against_watchdog() {
    let harness = Harness::new().agent(converter()).validator(Stalled);
    let orchestrator = harness.orchestrator();

    let mut wf = with_validation(
        workflow("stalled", vec![step("convert", "convert", &[])]),
        &["stalled"],
    );
    wf.timeout_seconds = 1;
    let session_id = orchestrator.submit(wf, json!({})).await.unwrap();
    let summary = settle(&orchestrator, session_id).await;

    assert_eq!(summary.state, SessionState::Cancelled);
    assert_eq!(summary.failure.unwrap().kind, FailureKind::SessionTimeout);
    // Work finished before the stage is kept
    assert_eq!(summary.steps["convert"], StepStatus::Succeeded);
    assert!(summary.validation.is_none());
    assert!(records(&orchestrator, session_id, RecordKind::Validation, None)
        .await
        .is_empty());
}

/// Validator that keeps every artifact it is shown
struct Recording {
    seen: Mutex<Vec<serde_json::Value>>,
}

#[async_trait]
impl ValidatorPort for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    async fn validate(&self, artifact: &serde_json::Value) -> Result<ValidatorOutcome> {
        self.seen.lock().unwrap().push(artifact.clone());
        Ok(ValidatorOutcome {
            validator: "recording".into(),
            issues: vec![ValidationIssue::new(
                "/general",
                "session_description",
                Severity::Warning,
                "empty description",
            )],
            score: 0.6,
        })
    }
}

fn replayed_workflow() -> convflow::domain::WorkflowDefinition {
    with_validation(
        workflow(
            "replayed",
            vec![
                step("meta", "metadata", &[]),
                step("convert", "convert", &["meta"]),
            ],
        ),
        &["inspector", "recording"],
    )
}

#[tokio::test]
async fn test_resumed_session_validates_like_uninterrupted() {
    let inspector = || {
        FixedValidator::new(
            "inspector",
            0.9,
            vec![ValidationIssue::new("/subject", "age", Severity::Info, "no age")],
        )
    };

    // Straight through
    let straight_seen = Arc::new(Recording { seen: Mutex::new(Vec::new()) });
    let mut straight = Harness::new()
        .agent(ScriptedAgent::always("meta", "metadata", json!({"subject_id": "m1"})))
        .agent(converter())
        .validator(inspector());
    straight.validators.push(straight_seen.clone());
    let orchestrator = straight.orchestrator();
    let session_id = orchestrator.submit(replayed_workflow(), json!({})).await.unwrap();
    let uninterrupted = settle(&orchestrator, session_id).await;
    assert_eq!(uninterrupted.state, SessionState::Completed);

    // Suspended, then resumed by a fresh orchestrator
    let resumed_seen = Arc::new(Recording { seen: Mutex::new(Vec::new()) });
    let mut interrupted = Harness::new()
        .agent(ScriptedAgent::new(
            "meta",
            "metadata",
            vec![
                needs_input(json!({"question": "Which subject?"}), &["subject_id"]),
                completed(json!({"subject_id": "m1"})),
            ],
        ))
        .agent(converter())
        .validator(inspector());
    interrupted.validators.push(resumed_seen.clone());
    let first = interrupted.orchestrator();
    let session_id = first.submit(replayed_workflow(), json!({})).await.unwrap();
    assert_eq!(settle(&first, session_id).await.state, SessionState::Suspended);
    assert!(resumed_seen.seen.lock().unwrap().is_empty());

    let second = interrupted.orchestrator();
    second.resume(session_id, json!({"subject_id": "m1"})).await.unwrap();
    let replayed = settle(&second, session_id).await;
    assert_eq!(replayed.state, SessionState::Completed);

    assert_eq!(replayed.validation, uninterrupted.validation);
    assert_eq!(replayed.validation.unwrap().overall_status, OverallStatus::Warning);
    assert_eq!(*resumed_seen.seen.lock().unwrap(), *straight_seen.seen.lock().unwrap());
    assert_eq!(resumed_seen.seen.lock().unwrap().len(), 1);
}
