//! Integration tests for seeding and expired-lease recycling.
//!
//! Test IDs:
//! - SD-001: Seeding creates up to N Ready rows per task type
//! - SD-002: exclude_already_seeded skips cases that already have a row
//! - SD-003: Conflicting candidates are dropped and the rest inserted
//! - SD-004: Finalized cases are never seeded
//! - SD-005: Zero count or no task types is a no-op
//! - SD-006: Concurrent seeders never duplicate an active row
//! - SD-007: Recycling returns only expired leases to Ready
//! - SD-008: An unbounded per-task count saturates instead of overflowing

use std::collections::HashMap;

use chrono::{Duration, Utc};
use futures::future::join_all;
use uuid::Uuid;

use medeval_db::InMemoryStore;
use medeval_workflow::{
    AssignmentArbiter, AssignmentRepository, AssignmentStatus, CaseRepository,
    FinalizationSource, NewCase, Round, SeedAssignmentsRequest, Seeder,
};

const CTA: &str = "ExamCoronaryCTA";
const XRAY: &str = "ExamChestXray";

async fn cases(store: &InMemoryStore, task_type: &str, n: usize) -> Vec<Uuid> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let case = CaseRepository::insert(
            store,
            NewCase {
                task_type: task_type.to_string(),
                raw_text: format!("report #{i}"),
                meta_info: None,
            },
        )
        .await
        .unwrap();
        ids.push(case.id);
    }
    ids
}

fn request(count: usize, task_types: &[&str], exclude: bool) -> SeedAssignmentsRequest {
    SeedAssignmentsRequest {
        per_task_type_count: count,
        task_types: task_types.iter().map(|t| t.to_string()).collect(),
        round: Round::First,
        exclude_already_seeded: exclude,
    }
}

async fn active_per_case(store: &InMemoryStore) -> HashMap<Uuid, usize> {
    let mut counts = HashMap::new();
    for a in store.all_assignments().await {
        if a.status.is_active() {
            *counts.entry(a.case_id).or_insert(0) += 1;
        }
    }
    counts
}

#[tokio::test]
async fn test_seed_per_task_type() {
    let store = InMemoryStore::new();
    let seeder = Seeder::new(store.repositories());
    let cta = cases(&store, CTA, 5).await;
    cases(&store, XRAY, 2).await;

    let result = seeder.seed(&request(3, &[CTA, XRAY], true)).await.unwrap();

    assert_eq!(result.requested_total, 6);
    assert_eq!(result.created_total, 5);
    assert_eq!(result.per_task_type.len(), 2);
    assert_eq!(result.per_task_type[0].task_type, CTA);
    assert_eq!(result.per_task_type[0].created, 3);
    assert_eq!(result.per_task_type[1].requested, 3);
    assert_eq!(result.per_task_type[1].created, 2);

    let rows = store.all_assignments().await;
    assert!(rows
        .iter()
        .all(|a| a.status == AssignmentStatus::Ready && a.attempt == 0 && a.round == Round::First));
    let seeded_cta: Vec<Uuid> = rows
        .iter()
        .map(|a| a.case_id)
        .filter(|id| cta.contains(id))
        .collect();
    assert_eq!(seeded_cta.len(), 3);
}

#[tokio::test]
async fn test_exclude_already_seeded() {
    let store = InMemoryStore::new();
    let seeder = Seeder::new(store.repositories());
    cases(&store, CTA, 4).await;

    let first = seeder.seed(&request(2, &[CTA], true)).await.unwrap();
    assert_eq!(first.created_total, 2);

    let second = seeder.seed(&request(2, &[CTA], true)).await.unwrap();
    assert_eq!(second.created_total, 2);

    let third = seeder.seed(&request(2, &[CTA], true)).await.unwrap();
    assert_eq!(third.created_total, 0);
    assert_eq!(store.all_assignments().await.len(), 4);
}

#[tokio::test]
async fn test_conflicting_candidates_dropped() {
    let store = InMemoryStore::new();
    let seeder = Seeder::new(store.repositories());
    let ids = cases(&store, CTA, 3).await;
    store
        .insert_ready(&ids[..1], Round::First, Utc::now())
        .await
        .unwrap();

    let result = seeder.seed(&request(3, &[CTA], false)).await.unwrap();

    assert_eq!(result.created_total, 2);
    let counts = active_per_case(&store).await;
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|n| *n == 1));
}

#[tokio::test]
async fn test_finalized_cases_not_seeded() {
    let store = InMemoryStore::new();
    let seeder = Seeder::new(store.repositories());
    let ids = cases(&store, CTA, 2).await;
    store
        .finalize_if_unset(ids[0], "true", FinalizationSource::AutoConfirm, None, Utc::now())
        .await
        .unwrap();

    let result = seeder.seed(&request(5, &[CTA], true)).await.unwrap();
    assert_eq!(result.created_total, 1);
    assert_eq!(store.all_assignments().await[0].case_id, ids[1]);
}

#[tokio::test]
async fn test_empty_requests() {
    let store = InMemoryStore::new();
    let seeder = Seeder::new(store.repositories());
    cases(&store, CTA, 2).await;

    let zero = seeder.seed(&request(0, &[CTA], true)).await.unwrap();
    assert_eq!(zero.created_total, 0);
    assert!(zero.per_task_type.is_empty());

    let blank = seeder.seed(&request(5, &["  "], true)).await.unwrap();
    assert_eq!(blank.requested_total, 0);
    assert!(store.all_assignments().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_seeders() {
    let store = InMemoryStore::new();
    cases(&store, CTA, 6).await;

    let seeders: Vec<Seeder> = (0..4).map(|_| Seeder::new(store.repositories())).collect();
    let req = request(6, &[CTA], true);
    let results = join_all(seeders.iter().map(|s| s.seed(&req))).await;

    let created: usize = results.into_iter().map(|r| r.unwrap().created_total).sum();
    assert_eq!(created, 6);

    let counts = active_per_case(&store).await;
    assert_eq!(counts.len(), 6);
    assert!(counts.values().all(|n| *n == 1));
}

#[tokio::test]
async fn test_recycle_expired() {
    let store = InMemoryStore::new();
    let seeder = Seeder::new(store.repositories());
    let arbiter = AssignmentArbiter::new(store.repositories());
    cases(&store, CTA, 3).await;
    seeder.seed(&request(3, &[CTA], true)).await.unwrap();

    let t0 = Utc::now();
    arbiter.acquire_at("alice", t0).await.unwrap().unwrap();
    arbiter.acquire_at("bob", t0).await.unwrap().unwrap();
    let t1 = t0 + Duration::minutes(10);
    let carol = arbiter.acquire_at("carol", t1).await.unwrap().unwrap();

    let sweep_at = t0 + arbiter.lease_duration() + Duration::seconds(1);
    assert_eq!(seeder.recycle_expired(sweep_at).await.unwrap(), 2);
    assert_eq!(seeder.recycle_expired(sweep_at).await.unwrap(), 0);

    for row in store.all_assignments().await {
        if row.id == carol.assignment_id {
            assert_eq!(row.status, AssignmentStatus::Assigned);
            assert_eq!(row.attempt, 0);
        } else {
            assert_eq!(row.status, AssignmentStatus::Ready);
            assert_eq!(row.attempt, 1);
            assert!(row.reviewer_id.is_none());
            assert!(row.assigned_at.is_none());
        }
    }
}

#[tokio::test]
async fn test_unbounded_count_saturates() {
    let store = InMemoryStore::new();
    let seeder = Seeder::new(store.repositories());
    cases(&store, CTA, 2).await;
    cases(&store, XRAY, 1).await;

    let result = seeder
        .seed(&request(usize::MAX, &[CTA, XRAY], true))
        .await
        .unwrap();

    assert_eq!(result.requested_total, usize::MAX);
    assert_eq!(result.created_total, 3);
    assert_eq!(result.per_task_type[0].requested, usize::MAX);
    assert_eq!(store.all_assignments().await.len(), 3);
}
