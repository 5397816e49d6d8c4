//! PostgreSQL lease store tests.
//!
//! This test suite validates:
//! - LS-001: Concurrent claims on one Ready row, exactly one wins
//! - LS-002: Renew and skip require the live holder
//! - LS-003: Bulk recycle reverts expired rows and increments attempt
//! - LS-004: Submit rolls back the annotation when the lease is gone
//! - LS-005: Duplicate active rows surface as UniqueViolation
//! - LS-006: ensure_second_round creates at most one active round-2 row
//! - LS-007: Gold label is write-once
//!
//! All tests need a migrated database (see `test_fixtures`).

use chrono::{Duration, Utc};
use futures::future::join_all;
use uuid::Uuid;

use medeval_db::test_fixtures::TestDatabase;
use medeval_db::{
    new_v7, Annotation, AnnotationRepository, AssignmentRepository, AssignmentStatus,
    CaseRepository, FinalizationSource, LeaseGuard, ReviewerRepository, Round, SubmitWrite,
};

async fn reviewer(db: &TestDatabase, prefix: &str) -> Uuid {
    db.db
        .reviewers
        .ensure(&format!("{}-{}", prefix, Uuid::new_v4().simple()))
        .await
        .expect("ensure reviewer")
        .id
}

fn annotation(case_id: Uuid, reviewer_id: Uuid, round: Round, value: &str) -> Annotation {
    let now = Utc::now();
    Annotation {
        id: new_v7(),
        case_id,
        task_type: "T".to_string(),
        value: value.to_string(),
        uncertainty: None,
        reviewer_id,
        round,
        started_at: now,
        submitted_at: now,
        created_at: now,
        difficulty_score: Some(2),
        confidence_score: Some(4),
    }
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_concurrent_claims_single_winner() {
    let test_db = TestDatabase::new().await;
    let task = TestDatabase::unique_task_type("LS001");
    let case = test_db.case(&task).await;
    let now = Utc::now();
    let repo = &test_db.db.assignments;

    repo.insert_ready(&[case.id], Round::First, now).await.unwrap();
    let row = repo.list_for_case(case.id).await.unwrap().remove(0);

    let mut reviewers = Vec::new();
    for _ in 0..12 {
        reviewers.push(reviewer(&test_db, "ls001").await);
    }
    let expires = now + Duration::minutes(20);
    let results = join_all(
        reviewers
            .iter()
            .map(|r| repo.claim(row.id, *r, now, expires)),
    )
    .await;

    let wins: u64 = results.into_iter().map(|r| r.unwrap()).sum();
    assert_eq!(wins, 1, "exactly one claim should succeed");

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_renew_and_skip_require_holder() {
    let test_db = TestDatabase::new().await;
    let case = test_db.case(&TestDatabase::unique_task_type("LS002")).await;
    let now = Utc::now();
    let repo = &test_db.db.assignments;
    let holder = reviewer(&test_db, "holder").await;
    let other = reviewer(&test_db, "other").await;

    repo.insert_ready(&[case.id], Round::First, now).await.unwrap();
    let row = repo.list_for_case(case.id).await.unwrap().remove(0);
    assert_eq!(
        repo.claim(row.id, holder, now, now + Duration::minutes(20)).await.unwrap(),
        1
    );

    let later = now + Duration::minutes(5);
    let new_expiry = later + Duration::minutes(20);
    assert_eq!(repo.renew(row.id, other, later, new_expiry).await.unwrap(), 0);
    assert_eq!(repo.renew(row.id, holder, later, new_expiry).await.unwrap(), 1);

    assert_eq!(repo.skip(row.id, other, None, later).await.unwrap(), 0);
    assert_eq!(repo.skip(row.id, holder, Some("unreadable"), later).await.unwrap(), 1);

    let row = repo.get(row.id).await.unwrap().unwrap();
    assert_eq!(row.status, AssignmentStatus::Skipped);
    assert_eq!(row.skip_reason.as_deref(), Some("unreadable"));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_recycle_expired_increments_attempt() {
    let test_db = TestDatabase::new().await;
    let case = test_db.case(&TestDatabase::unique_task_type("LS003")).await;
    let now = Utc::now();
    let repo = &test_db.db.assignments;
    let holder = reviewer(&test_db, "ls003").await;

    repo.insert_ready(&[case.id], Round::First, now).await.unwrap();
    let row = repo.list_for_case(case.id).await.unwrap().remove(0);
    repo.claim(row.id, holder, now, now + Duration::minutes(20))
        .await
        .unwrap();

    let after_expiry = now + Duration::minutes(21);
    assert!(repo.recycle_expired(after_expiry).await.unwrap() >= 1);

    let row = repo.get(row.id).await.unwrap().unwrap();
    assert_eq!(row.status, AssignmentStatus::Ready);
    assert_eq!(row.reviewer_id, None);
    assert_eq!(row.expires_at, None);
    assert_eq!(row.attempt, 1);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_submit_rolls_back_on_lost_lease() {
    let test_db = TestDatabase::new().await;
    let case = test_db.case(&TestDatabase::unique_task_type("LS004")).await;
    let now = Utc::now();
    let repo = &test_db.db.assignments;
    let holder = reviewer(&test_db, "ls004").await;

    repo.insert_ready(&[case.id], Round::First, now).await.unwrap();
    let row = repo.list_for_case(case.id).await.unwrap().remove(0);
    repo.claim(row.id, holder, now, now + Duration::minutes(20))
        .await
        .unwrap();

    let guard = LeaseGuard {
        assignment_id: row.id,
        case_id: case.id,
        reviewer_id: holder,
    };
    let too_late = now + Duration::minutes(25);
    let outcome = repo
        .submit(&guard, &annotation(case.id, holder, Round::First, "true"), too_late)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitWrite::LeaseLost);
    assert!(test_db.db.annotations.list_for_case(case.id).await.unwrap().is_empty());

    let in_time = now + Duration::minutes(1);
    let outcome = repo
        .submit(&guard, &annotation(case.id, holder, Round::First, "true"), in_time)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitWrite::Committed);
    assert_eq!(test_db.db.annotations.list_for_case(case.id).await.unwrap().len(), 1);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_duplicate_active_row_is_unique_violation() {
    let test_db = TestDatabase::new().await;
    let a = test_db.case(&TestDatabase::unique_task_type("LS005")).await;
    let b = test_db.case(&TestDatabase::unique_task_type("LS005")).await;
    let now = Utc::now();
    let repo = &test_db.db.assignments;

    repo.insert_ready(&[a.id], Round::First, now).await.unwrap();
    let err = repo
        .insert_ready(&[b.id, a.id], Round::First, now)
        .await
        .unwrap_err();
    assert!(err.is_unique_violation());

    // Whole batch rejected.
    assert!(repo.list_for_case(b.id).await.unwrap().is_empty());
    assert_eq!(
        repo.active_case_ids(&[a.id, b.id], Round::First).await.unwrap(),
        vec![a.id]
    );

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_ensure_second_round_once() {
    let test_db = TestDatabase::new().await;
    let case = test_db.case(&TestDatabase::unique_task_type("LS006")).await;
    let now = Utc::now();
    let repo = &test_db.db.assignments;

    let results = join_all((0..4).map(|_| repo.ensure_second_round(case.id, now))).await;
    let created: u64 = results.into_iter().map(|r| r.unwrap()).sum();
    assert_eq!(created, 1);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_gold_label_write_once() {
    let test_db = TestDatabase::new().await;
    let case = test_db.case(&TestDatabase::unique_task_type("LS007")).await;
    let cases = &test_db.db.cases;
    let now = Utc::now();

    let first = cases
        .finalize_if_unset(case.id, "true", FinalizationSource::AutoConfirm, None, now)
        .await
        .unwrap();
    let adjudicator = reviewer(&test_db, "adj").await;
    let second = cases
        .adjudicate(case.id, &case.task_type, "false", adjudicator, None, now)
        .await
        .unwrap();
    assert_eq!((first, second), (1, 0));

    let stored = cases.get(case.id).await.unwrap().unwrap();
    assert_eq!(stored.final_gold_label.as_deref(), Some("true"));
    assert_eq!(stored.finalization_source, Some(FinalizationSource::AutoConfirm));

    test_db.cleanup().await;
}
