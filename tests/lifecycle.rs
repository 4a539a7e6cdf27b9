//! Session Lifecycle Integration Tests
//!
//! Retries, suspension and resume, conditional steps and field conflicts
//! driven end to end through the orchestrator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use convflow::core::InputError;
use convflow::domain::{
    InputKind, RecordKind, RelationKind, SessionState, StepCondition, StepStatus,
};
use serde_json::json;

#[tokio::test]
async fn test_retry_suspend_resume_complete() {
    let harness = Harness::new()
        .agent(ScriptedAgent::always("detector", "detect", json!({"format": "spikeglx"})))
        .agent(ScriptedAgent::new(
            "converter",
            "convert",
            vec![
                transient("disk busy"),
                transient("disk busy"),
                completed(json!({"nwb": "/out/rec.nwb"})),
            ],
        ))
        .agent(ScriptedAgent::new(
            "questioner",
            "metadata",
            vec![
                needs_input(json!({"question": "Which subject?"}), &["subject_id"]),
                completed(json!({"subject_id": "m1"})),
            ],
        ));
    let orchestrator = harness.orchestrator();

    let wf = workflow(
        "abc",
        vec![
            step("a", "detect", &[]),
            step("b", "convert", &["a"]),
            step("c", "metadata", &["a"]),
        ],
    );
    let session_id = orchestrator.submit(wf, json!({"path": "/data"})).await.unwrap();

    // C asks a question while B retries; the session suspends once B settles
    let summary = settle(&orchestrator, session_id).await;
    assert_eq!(summary.state, SessionState::Suspended);
    assert_eq!(summary.steps["a"], StepStatus::Succeeded);
    assert_eq!(summary.steps["b"], StepStatus::Succeeded);
    assert_eq!(summary.steps["c"], StepStatus::NeedsInput);
    assert!(summary.expires_at.is_some());

    let request = summary.pending_input.expect("pending input");
    assert_eq!(request.step_name, "c");
    assert_eq!(request.required, vec!["subject_id"]);

    // Input missing a required key is rejected and changes nothing
    let err = orchestrator
        .resume(session_id, json!({"species": "mouse"}))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<InputError>(),
        Some(InputError::MissingKeys { .. })
    ));
    let unchanged = orchestrator.status(session_id).await.unwrap();
    assert_eq!(unchanged.state, SessionState::Suspended);
    assert_eq!(unchanged.checkpoint_version, summary.checkpoint_version);

    orchestrator
        .resume(session_id, json!({"subject_id": "m1"}))
        .await
        .unwrap();
    let summary = settle(&orchestrator, session_id).await;
    assert_eq!(summary.state, SessionState::Completed);
    assert!(summary.expires_at.is_none());

    // B: three attempts, C: asked once and answered once
    assert_eq!(harness.get("converter").calls(), 3);
    let c_requests = harness.get("questioner").requests();
    assert_eq!(c_requests.len(), 2);
    assert_eq!(c_requests[0].supplied_input, None);
    assert_eq!(c_requests[1].supplied_input, Some(json!({"subject_id": "m1"})));
    assert_eq!(c_requests[1].upstream["a"], json!({"format": "spikeglx"}));

    // Every attempt of B is recorded, each linked to the one before it
    let b_attempts = records(&orchestrator, session_id, RecordKind::Invocation, Some("b")).await;
    assert_eq!(b_attempts.len(), 3);
    for pair in b_attempts.windows(2) {
        let previous = pair[0].activity.as_ref().unwrap();
        let current = &pair[1];
        assert!(current.relations.iter().any(|r| r.kind == RelationKind::RetryOf
            && r.object == previous.id
            && r.subject == current.activity.as_ref().unwrap().id));
    }
    assert!(b_attempts[0]
        .relations
        .iter()
        .all(|r| r.kind != RelationKind::RetryOf));
    let attempts: Vec<_> = b_attempts
        .iter()
        .map(|r| r.activity.as_ref().unwrap().attempt)
        .collect();
    assert_eq!(attempts, vec![Some(1), Some(2), Some(3)]);

    // The answered attempt used the supplied input entity
    let c_attempts = records(&orchestrator, session_id, RecordKind::Invocation, Some("c")).await;
    assert_eq!(c_attempts.len(), 2);
    assert!(c_attempts[1].relations.iter().any(|r| r.kind == RelationKind::Used
        && r.object.starts_with("entity:c:supplied:")));
}

#[tokio::test]
async fn test_join_waits_for_retrying_branch() {
    let concurrency = Arc::new(Concurrency::default());
    let pause = Duration::from_millis(100);
    let harness = Harness::new()
        .agent(
            ScriptedAgent::new(
                "detector",
                "detect",
                vec![delayed(pause, completed(json!({"format": "spikeglx"})))],
            )
            .tracking(concurrency.clone()),
        )
        .agent(
            ScriptedAgent::new(
                "converter",
                "convert",
                vec![
                    delayed(pause, transient("disk busy")),
                    delayed(pause, transient("disk busy")),
                    delayed(pause, completed(json!({"nwb": "/out/rec.nwb"}))),
                ],
            )
            .tracking(concurrency.clone()),
        )
        .agent(ScriptedAgent::always("finisher", "finalize", json!({"done": true})));
    let orchestrator = harness.orchestrator();

    let wf = workflow(
        "join",
        vec![
            step("a", "detect", &[]),
            step("b", "convert", &[]),
            step("c", "finalize", &["a", "b"]),
        ],
    );
    let session_id = orchestrator.submit(wf, json!({})).await.unwrap();

    // A is long done and B is on its last attempt; C still waits
    for _ in 0..500 {
        if harness.get("converter").calls() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.get("converter").calls(), 3);
    assert_eq!(harness.get("finisher").calls(), 0);

    let summary = settle(&orchestrator, session_id).await;
    assert_eq!(summary.state, SessionState::Completed);
    assert_eq!(harness.get("finisher").calls(), 1);

    // The two roots ran side by side
    assert_eq!(concurrency.peak(), 2);

    let c_request = &harness.get("finisher").requests()[0];
    assert_eq!(c_request.upstream["a"], json!({"format": "spikeglx"}));
    assert_eq!(c_request.upstream["b"], json!({"nwb": "/out/rec.nwb"}));

    let b_attempts = records(&orchestrator, session_id, RecordKind::Invocation, Some("b")).await;
    assert_eq!(b_attempts.len(), 3);
    for pair in b_attempts.windows(2) {
        let previous = pair[0].activity.as_ref().unwrap();
        let current = &pair[1];
        assert!(current.relations.iter().any(|r| r.kind == RelationKind::RetryOf
            && r.object == previous.id
            && r.subject == current.activity.as_ref().unwrap().id));
    }
    let attempts: Vec<_> = b_attempts
        .iter()
        .map(|r| r.activity.as_ref().unwrap().attempt)
        .collect();
    assert_eq!(attempts, vec![Some(1), Some(2), Some(3)]);

    // C started only after B's final attempt ended
    let c_attempts = records(&orchestrator, session_id, RecordKind::Invocation, Some("c")).await;
    assert_eq!(c_attempts.len(), 1);
    assert!(c_attempts[0].sequence > b_attempts[2].sequence);
    let b_ended = b_attempts[2].activity.as_ref().unwrap().ended_at.unwrap();
    assert!(c_attempts[0].activity.as_ref().unwrap().started_at >= b_ended);
}

#[tokio::test]
async fn test_resume_on_completed_session_is_idempotent() {
    let harness = Harness::new().agent(ScriptedAgent::always("a1", "detect", json!({})));
    let orchestrator = harness.orchestrator();

    let session_id = orchestrator
        .submit(workflow("one", vec![step("a", "detect", &[])]), json!({}))
        .await
        .unwrap();
    let done = settle(&orchestrator, session_id).await;
    assert_eq!(done.state, SessionState::Completed);

    let again = orchestrator.resume(session_id, json!({"x": 1})).await.unwrap();
    assert_eq!(again.state, SessionState::Completed);
    assert_eq!(again.checkpoint_version, done.checkpoint_version);
    assert_eq!(harness.get("a1").calls(), 1);
}

#[tokio::test]
async fn test_conditional_step_is_skipped() {
    let harness = Harness::new()
        .agent(ScriptedAgent::always("detector", "detect", json!({"format": "spikeglx"})))
        .agent(ScriptedAgent::always("glx", "convert_spikeglx", json!({"ok": true})))
        .agent(ScriptedAgent::always("oe", "convert_openephys", json!({"ok": true})))
        .agent(ScriptedAgent::always("fin", "finalize", json!({"done": true})));
    let orchestrator = harness.orchestrator();

    let condition = |format: &str| StepCondition {
        step: "detect".into(),
        pointer: "/format".into(),
        equals: json!(format),
    };
    let mut glx = step("spikeglx", "convert_spikeglx", &["detect"]);
    glx.run_if = Some(condition("spikeglx"));
    let mut oe = step("openephys", "convert_openephys", &["detect"]);
    oe.run_if = Some(condition("openephys"));

    let wf = workflow(
        "branching",
        vec![
            step("detect", "detect", &[]),
            glx,
            oe,
            step("finalize", "finalize", &["spikeglx", "openephys"]),
        ],
    );
    let session_id = orchestrator.submit(wf, json!({})).await.unwrap();
    let summary = settle(&orchestrator, session_id).await;

    assert_eq!(summary.state, SessionState::Completed);
    assert_eq!(summary.steps["openephys"], StepStatus::Skipped);
    assert_eq!(summary.steps["spikeglx"], StepStatus::Succeeded);
    assert_eq!(summary.steps["finalize"], StepStatus::Succeeded);
    assert_eq!(harness.get("oe").calls(), 0);
    assert_eq!(harness.get("fin").calls(), 1);
}

#[tokio::test]
async fn test_conflict_resolved_by_confidence() {
    let harness = Harness::new()
        .agent(ScriptedAgent::new(
            "reader",
            "read_header",
            vec![proposing(json!({}), vec![proposal("species", json!("Mus musculus"), 0.9)])],
        ))
        .agent(ScriptedAgent::new(
            "guesser",
            "guess",
            vec![proposing(json!({}), vec![proposal("species", json!("Rattus"), 0.6)])],
        ));
    let orchestrator = harness.orchestrator();

    let session_id = orchestrator
        .submit(
            workflow(
                "conflict",
                vec![step("header", "read_header", &[]), step("guess", "guess", &[])],
            ),
            json!({}),
        )
        .await
        .unwrap();
    let summary = settle(&orchestrator, session_id).await;
    assert_eq!(summary.state, SessionState::Completed);

    let session = orchestrator
        .state_manager()
        .load_checkpoint(session_id)
        .await
        .unwrap()
        .checkpoint
        .session;
    assert_eq!(session.fields["species"].value, json!("Mus musculus"));
    assert_eq!(session.fields["species"].source_step, "header");

    let conflicts =
        records(&orchestrator, session_id, RecordKind::ConflictResolution, None).await;
    assert_eq!(conflicts.len(), 1);
    let annotation = conflicts[0].annotation.as_ref().unwrap();
    assert_eq!(annotation.method.as_deref(), Some("highest_confidence"));
    assert_eq!(annotation.confidence, Some(0.9));
    // One entity per candidate plus the resolution
    assert_eq!(conflicts[0].entities.len(), 3);
}

#[tokio::test]
async fn test_equal_confidence_conflict_needs_human_decision() {
    let harness = Harness::new()
        .agent(ScriptedAgent::new(
            "left",
            "left",
            vec![proposing(json!({}), vec![proposal("sex", json!("F"), 0.7)])],
        ))
        .agent(ScriptedAgent::new(
            "right",
            "right",
            vec![proposing(json!({}), vec![proposal("sex", json!("M"), 0.7)])],
        ));
    let orchestrator = harness.orchestrator();

    let session_id = orchestrator
        .submit(
            workflow("tie", vec![step("l", "left", &[]), step("r", "right", &[])]),
            json!({}),
        )
        .await
        .unwrap();
    let summary = settle(&orchestrator, session_id).await;
    assert_eq!(summary.state, SessionState::Suspended);

    let request = summary.pending_input.expect("conflict request");
    let conflict_record = match &request.kind {
        InputKind::ConflictResolution {
            field,
            conflict_record,
            candidates,
        } => {
            assert_eq!(field, "sex");
            assert_eq!(candidates.len(), 2);
            conflict_record.clone()
        }
        other => panic!("unexpected request {:?}", other),
    };

    orchestrator
        .resume(session_id, json!({"value": "F"}))
        .await
        .unwrap();
    let summary = settle(&orchestrator, session_id).await;
    assert_eq!(summary.state, SessionState::Completed);

    let session = orchestrator
        .state_manager()
        .load_checkpoint(session_id)
        .await
        .unwrap()
        .checkpoint
        .session;
    assert_eq!(session.fields["sex"].value, json!("F"));
    assert_eq!(session.fields["sex"].confidence, 1.0);

    let conflicts =
        records(&orchestrator, session_id, RecordKind::ConflictResolution, None).await;
    let methods: Vec<_> = conflicts
        .iter()
        .map(|r| r.annotation.as_ref().unwrap().method.clone().unwrap())
        .collect();
    assert_eq!(methods, vec!["human_required", "human_decision"]);
    assert!(conflicts[1]
        .relations
        .iter()
        .any(|r| r.kind == RelationKind::WasDerivedFrom && r.object == conflict_record));
}
