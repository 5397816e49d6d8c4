//! Integration tests for the evaluation report over converged workflow data.
//!
//! Test IDs:
//! - RP-001: Flow counts and accuracies reflect the converged cases
//! - RP-002: Task filter is case-insensitive
//! - RP-003: Text and JSON renderings

use chrono::{Duration, Utc};
use uuid::Uuid;

use medeval_db::InMemoryStore;
use medeval_workflow::{
    AssignmentArbiter, AssignmentRepository, CaseRepository, EvaluationReport,
    EvaluationReporter, ExtractionRepository, McNemarOutcome, NewCase, NewExtraction, QcPipeline,
    QcProgressRequest, Round, SubmitAnnotationRequest,
};

const CTA: &str = "ExamCoronaryCTA";

async fn submit(arbiter: &AssignmentArbiter, login: &str, value: &str) -> Uuid {
    let now = Utc::now();
    let work = arbiter.acquire_at(login, now).await.unwrap().unwrap();
    let resp = arbiter
        .submit_at(
            login,
            &SubmitAnnotationRequest {
                assignment_id: work.assignment_id,
                case_id: work.case_id,
                task_type: work.task_type.clone(),
                value: value.to_string(),
                note: None,
                started_at: now,
                submitted_at: now + Duration::seconds(30),
                difficulty: None,
                confidence: None,
            },
            now,
        )
        .await
        .unwrap();
    assert!(resp.ok, "{}", resp.message);
    work.case_id
}

/// Three CTA cases driven to gold plus one untouched chest x-ray case.
///
/// | case | automated | R1  | R2  | gold  |
/// |------|-----------|-----|-----|-------|
/// | 1    | yes       | yes | -   | true  |
/// | 2    | no        | yes | yes | true  |
/// | 3    | yes       | no  | no  | false |
async fn converged_store() -> InMemoryStore {
    let store = InMemoryStore::new();
    let arbiter = AssignmentArbiter::new(store.repositories());
    let qc = QcPipeline::new(store.repositories());

    for (automated, round1) in [("yes", "yes"), ("no", "yes"), ("yes", "no")] {
        let case = CaseRepository::insert(
            &store,
            NewCase {
                task_type: CTA.to_string(),
                raw_text: "CTA report".to_string(),
                meta_info: None,
            },
        )
        .await
        .unwrap();
        ExtractionRepository::insert(
            &store,
            NewExtraction {
                case_id: case.id,
                parsed_value: automated.to_string(),
                parsed_successfully: true,
                raw_response: automated.to_string(),
                error_code: None,
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        store
            .insert_ready(&[case.id], Round::First, Utc::now())
            .await
            .unwrap();
        submit(&arbiter, "alice", round1).await;
    }

    CaseRepository::insert(
        &store,
        NewCase {
            task_type: "ExamChestXray".to_string(),
            raw_text: "CXR report".to_string(),
            meta_info: None,
        },
    )
    .await
    .unwrap();

    let req = QcProgressRequest {
        create_audit_assignments: false,
        ..QcProgressRequest::default()
    };
    let first = qc.run(&req).await.unwrap();
    assert_eq!(first.auto_confirmed, 1);
    assert_eq!(first.sent_to_round2, 2);

    submit(&arbiter, "bob", "yes").await;
    submit(&arbiter, "bob", "no").await;
    let second = qc.run(&req).await.unwrap();
    assert_eq!(second.finalized_by_agreement, 2);

    store
}

async fn report(store: &InMemoryStore, filter: &[&str]) -> EvaluationReport {
    let filter: Vec<String> = filter.iter().map(|t| t.to_string()).collect();
    EvaluationReporter::new(store.repositories())
        .build(&filter)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_report_counts() {
    let store = converged_store().await;
    let report = report(&store, &[]).await;
    let eval = &report.evaluation;

    assert_eq!(eval.total_cases, 4);
    assert_eq!(eval.tasks.len(), 2);

    let cta = eval
        .tasks
        .iter()
        .find(|t| t.task_type == "EXAMCORONARYCTA")
        .expect("CTA section");
    assert_eq!(cta.flow.n, 3);
    assert_eq!(cta.flow.round1_present, 3);
    assert_eq!(cta.flow.round2_present, 2);
    assert_eq!(cta.flow.gold_present, 3);
    assert_eq!(cta.flow.automated_present, 3);
    assert_eq!(cta.flow.round1_eq_automated, 1);
    assert_eq!(cta.flow.round1_ne_automated, 2);
    assert_eq!(cta.flow.round1_ne_round2, 0);
    assert_eq!(cta.flow.gold_ne_round1, 0);
    assert_eq!(cta.flow.gold_ne_automated, 2);

    let automated = cta.automated_accuracy.as_ref().unwrap();
    assert_eq!((automated.correct, automated.n), (1, 3));
    let round1 = cta.round1_accuracy.as_ref().unwrap();
    assert_eq!((round1.correct, round1.n), (3, 3));
    assert!(matches!(cta.mcnemar, McNemarOutcome::Undersized { .. }));

    let xray = eval
        .tasks
        .iter()
        .find(|t| t.task_type == "EXAMCHESTXRAY")
        .expect("x-ray section");
    assert_eq!(xray.flow.n, 1);
    assert_eq!(xray.flow.gold_present, 0);
    assert!(xray.automated_accuracy.is_none());
}

#[tokio::test]
async fn test_report_filter_case_insensitive() {
    let store = converged_store().await;
    let report = report(&store, &["examcoronarycta"]).await;

    assert_eq!(report.evaluation.total_cases, 3);
    assert_eq!(report.evaluation.tasks.len(), 1);
    assert_eq!(report.evaluation.tasks[0].task_type, "EXAMCORONARYCTA");
}

#[tokio::test]
async fn test_report_renderings() {
    let store = converged_store().await;
    let report = report(&store, &[]).await;

    let text = report.render_text();
    assert!(text.contains("Tasks: 2  |  Total cases analyzed: 4"));
    assert!(text.contains("Task: EXAMCORONARYCTA"));
    assert!(text.contains("- R1 != Automated: 2"));
    assert!(text.contains("- R1: accuracy=100.00%"));
    assert!(text.contains("McNemar skipped"));

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["evaluation"]["total_cases"], 4);
    assert!(json["generated_at"].is_string());
}
