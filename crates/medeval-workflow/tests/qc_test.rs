//! Integration tests for QC convergence and adjudication against the in-memory store.
//!
//! Test IDs:
//! - QC-001: Automated == round 1 auto-confirms once; re-runs are no-ops
//! - QC-002: Mismatch opens exactly one round-2 row across re-runs
//! - QC-003: Missing, unparsed and refused inputs are skipped
//! - QC-004: Audited agreements wait for round 2, then finalize by agreement
//! - QC-005: Round-2 disagreement marks the case for adjudication
//! - QC-006: Adjudication finalizes once and closes open assignments
//! - QC-007: Adjudication declines unknown adjudicators and mismatched task types
//! - QC-008: Seeded audit sampling is reproducible
//! - QC-009: Task filter and max_cases bound the first pass

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use medeval_db::InMemoryStore;
use medeval_workflow::{
    AdjudicationRequest, Assignment, AssignmentArbiter, AssignmentRepository, AssignmentStatus,
    Case, CaseRepository, CaseStatus, ExtractionRepository, FinalizationSource, NewCase,
    NewExtraction, QcPipeline, QcProgressRequest, QcProgressResult, ReviewerRepository, Round,
    SubmitAnnotationRequest, SubmitStatus,
};

const CTA: &str = "ExamCoronaryCTA";

struct Fixture {
    store: InMemoryStore,
    arbiter: AssignmentArbiter,
    qc: QcPipeline,
    now: DateTime<Utc>,
}

impl Fixture {
    fn new() -> Self {
        let store = InMemoryStore::new();
        Self {
            arbiter: AssignmentArbiter::new(store.repositories()),
            qc: QcPipeline::new(store.repositories()),
            store,
            now: Utc::now(),
        }
    }

    async fn case(&self, task_type: &str) -> Uuid {
        CaseRepository::insert(
            &self.store,
            NewCase {
                task_type: task_type.to_string(),
                raw_text: "Findings: calcified plaque in the proximal RCA.".to_string(),
                meta_info: Some("{\"age\": 61}".to_string()),
            },
        )
        .await
        .unwrap()
        .id
    }

    async fn extraction(&self, case_id: Uuid, value: &str, parsed: bool) {
        ExtractionRepository::insert(
            &self.store,
            NewExtraction {
                case_id,
                parsed_value: value.to_string(),
                parsed_successfully: parsed,
                raw_response: value.to_string(),
                error_code: (!parsed).then(|| "parse_error".to_string()),
                created_at: self.now,
            },
        )
        .await
        .unwrap();
    }

    /// Seed a round-1 row for `case_id` and have `login` annotate it.
    async fn round1(&self, login: &str, case_id: Uuid, value: &str) {
        self.store
            .insert_ready(&[case_id], Round::First, self.now)
            .await
            .unwrap();
        self.annotate(login, case_id, Round::First, value).await;
    }

    /// Annotate the Ready row the arbiter hands to `login`, which must be `case_id`.
    async fn annotate(&self, login: &str, case_id: Uuid, round: Round, value: &str) {
        let work = self
            .arbiter
            .acquire_at(login, self.now)
            .await
            .unwrap()
            .expect("work available");
        assert_eq!(work.case_id, case_id);
        assert_eq!(work.round, round);

        let resp = self
            .arbiter
            .submit_at(
                login,
                &SubmitAnnotationRequest {
                    assignment_id: work.assignment_id,
                    case_id,
                    task_type: work.task_type.clone(),
                    value: value.to_string(),
                    note: None,
                    started_at: self.now,
                    submitted_at: self.now + Duration::seconds(90),
                    difficulty: Some(3),
                    confidence: Some(3),
                },
                self.now,
            )
            .await
            .unwrap();
        assert_eq!(resp.status, SubmitStatus::Saved);
    }

    async fn run(&self, audit_rate: f64) -> QcProgressResult {
        self.qc.run(&request(audit_rate, 7)).await.unwrap()
    }

    async fn case_row(&self, id: Uuid) -> Case {
        CaseRepository::get(&self.store, id).await.unwrap().expect("case exists")
    }

    async fn round2_rows(&self, case_id: Uuid) -> Vec<Assignment> {
        self.store
            .all_assignments()
            .await
            .into_iter()
            .filter(|a| a.case_id == case_id && a.round == Round::Second)
            .collect()
    }
}

fn request(audit_rate: f64, seed: u64) -> QcProgressRequest {
    QcProgressRequest {
        audit_rate,
        create_audit_assignments: audit_rate > 0.0,
        rng_seed: Some(seed),
        ..QcProgressRequest::default()
    }
}

// =============================================================================
// PASS 1
// =============================================================================

#[tokio::test]
async fn test_auto_confirm_once() {
    let fx = Fixture::new();
    let id = fx.case(CTA).await;
    fx.extraction(id, "yes", true).await;
    fx.round1("alice", id, "Positive").await;

    let result = fx.run(0.0).await;
    assert_eq!(result.scanned, 1);
    assert_eq!(result.auto_confirmed, 1);
    assert_eq!(result.sent_to_round2, 0);

    let case = fx.case_row(id).await;
    assert_eq!(case.final_gold_label.as_deref(), Some("true"));
    assert_eq!(case.finalization_source, Some(FinalizationSource::AutoConfirm));
    assert_eq!(case.status, CaseStatus::Finalized);
    let finalized_at = case.finalized_at;

    let again = fx.run(0.0).await;
    assert_eq!(again, QcProgressResult::default());
    let case = fx.case_row(id).await;
    assert_eq!(case.finalized_at, finalized_at);
}

#[tokio::test]
async fn test_mismatch_opens_single_round_two() {
    let fx = Fixture::new();
    let id = fx.case(CTA).await;
    fx.extraction(id, "false", true).await;
    fx.round1("alice", id, "true").await;

    let result = fx.run(0.0).await;
    assert_eq!(result.sent_to_round2, 1);
    assert_eq!(result.auto_confirmed, 0);

    let again = fx.run(0.0).await;
    assert_eq!(again.sent_to_round2, 1);

    let rows = fx.round2_rows(id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, AssignmentStatus::Ready);
    assert!(fx.case_row(id).await.final_gold_label.is_none());
}

#[tokio::test]
async fn test_missing_inputs_skipped() {
    let fx = Fixture::new();

    let no_extraction = fx.case(CTA).await;
    fx.round1("alice", no_extraction, "yes").await;

    let unparsed = fx.case(CTA).await;
    fx.extraction(unparsed, "yes", false).await;
    fx.round1("alice", unparsed, "yes").await;

    let refused = fx.case(CTA).await;
    fx.extraction(refused, "I'm sorry, I cannot help with that.", true).await;
    fx.round1("alice", refused, "yes").await;

    let no_round1 = fx.case(CTA).await;
    fx.extraction(no_round1, "yes", true).await;

    let result = fx.run(0.0).await;
    assert_eq!(result.scanned, 4);
    assert_eq!(result.skipped_missing, 4);
    assert_eq!(result.auto_confirmed + result.sent_to_round2 + result.audited, 0);
    assert!(fx
        .store
        .all_assignments()
        .await
        .iter()
        .all(|a| a.round == Round::First));
}

#[tokio::test]
async fn test_audit_then_agreement() {
    let fx = Fixture::new();
    let id = fx.case(CTA).await;
    fx.extraction(id, "yes", true).await;
    fx.round1("alice", id, "yes").await;

    let audited = fx.run(1.0).await;
    assert_eq!(audited.audited, 1);
    assert_eq!(audited.auto_confirmed, 0);
    assert_eq!(fx.round2_rows(id).await.len(), 1);

    // open round-2 row blocks auto-confirm
    let waiting = fx.run(0.0).await;
    assert_eq!(waiting.auto_confirmed, 0);
    assert!(fx.case_row(id).await.final_gold_label.is_none());

    fx.annotate("bob", id, Round::Second, "y").await;
    let result = fx.run(0.0).await;
    assert_eq!(result.finalized_by_agreement, 1);

    let case = fx.case_row(id).await;
    assert_eq!(case.final_gold_label.as_deref(), Some("true"));
    assert_eq!(case.finalization_source, Some(FinalizationSource::Agreement));
}

// =============================================================================
// PASS 2 / ADJUDICATION
// =============================================================================

/// A case where automated and round 1 disagree and round 2 sides with the model.
async fn disputed(fx: &Fixture) -> Uuid {
    let id = fx.case(CTA).await;
    fx.extraction(id, "no", true).await;
    fx.round1("alice", id, "yes").await;
    assert_eq!(fx.run(0.0).await.sent_to_round2, 1);
    fx.annotate("bob", id, Round::Second, "no").await;
    id
}

#[tokio::test]
async fn test_disagreement_needs_adjudication() {
    let fx = Fixture::new();
    let id = disputed(&fx).await;

    let result = fx.run(0.0).await;
    assert_eq!(result.needs_adjudication, 1);
    assert_eq!(result.finalized_by_agreement, 0);

    let case = fx.case_row(id).await;
    assert_eq!(case.status, CaseStatus::NeedsAdjudication);
    assert!(case.final_gold_label.is_none());

    let pending = fx.qc.pending_adjudication(None, None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].case_id, id);
    assert_eq!(pending[0].round1_value, "yes");
    assert_eq!(pending[0].round2_value, "no");
    assert_eq!(pending[0].automated_value.as_deref(), Some("no"));

    let other_task = fx
        .qc
        .pending_adjudication(Some("ExamChestXray"), None)
        .await
        .unwrap();
    assert!(other_task.is_empty());
}

#[tokio::test]
async fn test_adjudication_finalizes_once() {
    let fx = Fixture::new();
    let id = disputed(&fx).await;
    fx.run(0.0).await;
    let carol = fx.store.ensure("carol").await.unwrap();

    let req = AdjudicationRequest {
        case_id: id,
        task_type: CTA.to_string(),
        final_label: "Negative".to_string(),
        note: Some("  reread images ".to_string()),
    };
    let result = fx.qc.adjudicate_at("carol", &req, fx.now).await.unwrap();
    assert!(result.ok, "{}", result.message);

    let case = fx.case_row(id).await;
    assert_eq!(case.final_gold_label.as_deref(), Some("false"));
    assert_eq!(case.finalization_source, Some(FinalizationSource::Adjudication));
    assert_eq!(case.finalized_by, Some(carol.id));
    assert_eq!(case.adjudication_note.as_deref(), Some("reread images"));
    assert_eq!(case.status, CaseStatus::Finalized);
    assert!(fx.qc.pending_adjudication(None, None).await.unwrap().is_empty());

    let mut again = req.clone();
    again.final_label = "positive".to_string();
    let second = fx.qc.adjudicate_at("carol", &again, fx.now).await.unwrap();
    assert!(!second.ok);
    assert_eq!(second.message, "Case already finalized.");
    assert_eq!(
        fx.case_row(id).await.final_gold_label.as_deref(),
        Some("false")
    );
}

#[tokio::test]
async fn test_adjudication_closes_open_assignments() {
    let fx = Fixture::new();
    let id = fx.case(CTA).await;
    fx.store
        .insert_ready(&[id], Round::First, fx.now)
        .await
        .unwrap();
    fx.arbiter.acquire_at("alice", fx.now).await.unwrap();
    fx.store.ensure("carol").await.unwrap();

    let result = fx
        .qc
        .adjudicate_at(
            "carol",
            &AdjudicationRequest {
                case_id: id,
                task_type: CTA.to_lowercase(),
                final_label: "yes".to_string(),
                note: None,
            },
            fx.now,
        )
        .await
        .unwrap();
    assert!(result.ok);

    let rows = fx.store.list_for_case(id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, AssignmentStatus::Skipped);
    assert!(rows[0].reviewer_id.is_none());
    assert!(fx.arbiter.acquire_at("alice", fx.now).await.unwrap().is_none());
}

#[tokio::test]
async fn test_adjudication_declined() {
    let fx = Fixture::new();
    let id = fx.case(CTA).await;

    let req = AdjudicationRequest {
        case_id: id,
        task_type: CTA.to_string(),
        final_label: "yes".to_string(),
        note: None,
    };
    let unknown = fx.qc.adjudicate_at("nobody", &req, fx.now).await.unwrap();
    assert!(!unknown.ok);
    assert_eq!(unknown.message, "Adjudicator not found.");

    fx.store.ensure("carol").await.unwrap();
    let mut wrong_task = req.clone();
    wrong_task.task_type = "ExamChestXray".to_string();
    let mismatch = fx.qc.adjudicate_at("carol", &wrong_task, fx.now).await.unwrap();
    assert!(!mismatch.ok);
    assert_eq!(mismatch.message, "Case not found or task type mismatch.");

    let mut missing = req.clone();
    missing.case_id = Uuid::new_v4();
    let not_found = fx.qc.adjudicate_at("carol", &missing, fx.now).await.unwrap();
    assert!(!not_found.ok);

    assert!(fx.case_row(id).await.final_gold_label.is_none());
}

// =============================================================================
// SAMPLING / SCOPE
// =============================================================================

async fn agreeing_store(n: usize) -> Fixture {
    let fx = Fixture::new();
    for _ in 0..n {
        let id = fx.case(CTA).await;
        fx.extraction(id, "yes", true).await;
        fx.round1("alice", id, "yes").await;
    }
    fx
}

#[tokio::test]
async fn test_seeded_audit_reproducible() {
    let a = agreeing_store(12).await;
    let b = agreeing_store(12).await;

    let ra = a.qc.run(&request(0.5, 42)).await.unwrap();
    let rb = b.qc.run(&request(0.5, 42)).await.unwrap();

    assert_eq!(ra, rb);
    assert_eq!(ra.audited + ra.auto_confirmed, 12);
}

#[tokio::test]
async fn test_filter_and_max_cases() {
    let fx = agreeing_store(3).await;
    let xray = fx.case("ExamChestXray").await;
    fx.extraction(xray, "nodule", true).await;
    fx.round1("alice", xray, "nodule").await;

    let limited = QcProgressRequest {
        task_types: vec![CTA.to_string()],
        max_cases: Some(2),
        ..request(0.0, 1)
    };
    let result = fx.qc.run(&limited).await.unwrap();
    assert_eq!(result.scanned, 2);
    assert_eq!(result.auto_confirmed, 2);
    assert!(fx.case_row(xray).await.final_gold_label.is_none());

    let rest = fx.qc.run(&request(0.0, 1)).await.unwrap();
    assert_eq!(rest.scanned, 2);
    assert_eq!(rest.auto_confirmed, 2);
}
