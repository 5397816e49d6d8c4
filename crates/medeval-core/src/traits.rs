//! Repository traits for the annotation workflow.
//!
//! The workflow crate depends only on these traits; `medeval-db` provides a
//! PostgreSQL implementation and an in-memory one with the same conditional
//! update semantics.
//!
//! Every state-changing method on [`AssignmentRepository`] and the gold-label
//! writers on [`CaseRepository`] are single guarded writes. They return the
//! number of rows affected; `0` means the guard did not match (lost race,
//! already finalized, wrong holder) and is never an error.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// REVIEWERS
// =============================================================================

/// Reviewer identity resolution.
#[async_trait]
pub trait ReviewerRepository: Send + Sync {
    /// Resolve a reviewer by login, creating it on first use.
    ///
    /// Concurrent first calls for the same login resolve to the same row.
    async fn ensure(&self, login_name: &str) -> Result<Reviewer>;

    /// Look up a reviewer without creating one.
    async fn find_by_login(&self, login_name: &str) -> Result<Option<Reviewer>>;
}

// =============================================================================
// CASES
// =============================================================================

#[async_trait]
pub trait CaseRepository: Send + Sync {
    /// Insert a new open case.
    async fn insert(&self, req: NewCase) -> Result<Case>;

    async fn get(&self, id: Uuid) -> Result<Option<Case>>;

    /// Cases without a gold label, ordered by id.
    ///
    /// An empty `task_types` slice matches every task type.
    async fn list_unfinalized(
        &self,
        task_types: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<CaseRef>>;

    /// Unfinalized cases of one task type eligible for seeding, ordered by id.
    ///
    /// With `exclude_seeded`, cases that already have any assignment for
    /// `round` are left out.
    async fn seed_candidates(
        &self,
        task_type: &str,
        round: Round,
        exclude_seeded: bool,
        limit: usize,
    ) -> Result<Vec<Uuid>>;

    /// Set the gold label only if it is still unset.
    async fn finalize_if_unset(
        &self,
        case_id: Uuid,
        label: &str,
        source: FinalizationSource,
        finalized_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Move an unfinalized case to `NeedsAdjudication`.
    async fn mark_needs_adjudication(&self, case_id: Uuid) -> Result<u64>;

    /// Manual adjudication write.
    ///
    /// Matches on id and task type (ASCII case-insensitive) and only if the
    /// gold label is still unset.
    async fn adjudicate(
        &self,
        case_id: Uuid,
        task_type: &str,
        label: &str,
        adjudicator_id: Uuid,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Cases in `NeedsAdjudication`, ordered by id.
    async fn list_pending_adjudication(
        &self,
        task_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Case>>;
}

// =============================================================================
// ASSIGNMENTS (LEASE STORE)
// =============================================================================

/// The lease store: conditional transitions on assignment rows.
#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Assignment>>;

    /// The reviewer's assigned, unexpired lease, if any (oldest first).
    async fn find_live_for_reviewer(
        &self,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>>;

    /// Best claimable Ready row for a reviewer in one round.
    ///
    /// Ordered by fewest attempts, then id. Rows in `excluded` are skipped so
    /// a caller that lost a race moves on to a different candidate.
    async fn next_candidate(
        &self,
        reviewer_id: Uuid,
        round: Round,
        excluded: &[Uuid],
    ) -> Result<Option<Assignment>>;

    /// Ready with no holder -> Assigned to `reviewer_id`.
    async fn claim(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Assigned to `reviewer_id` and unexpired -> expiry pushed to `expires_at`.
    async fn renew(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// One Assigned-and-expired row -> Ready, holder cleared, attempt + 1.
    async fn release_expired(&self, id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    /// Every Assigned-and-expired row -> Ready in one bulk write.
    async fn recycle_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Write the annotation and move the held lease to Submitted atomically.
    ///
    /// If the guarded transition matches no row the annotation insert is
    /// rolled back as well.
    async fn submit(
        &self,
        guard: &LeaseGuard,
        annotation: &Annotation,
        now: DateTime<Utc>,
    ) -> Result<SubmitWrite>;

    /// Assigned to `reviewer_id` and unexpired -> Skipped.
    async fn skip(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Bulk-create Ready rows, all or nothing.
    ///
    /// Fails with [`crate::Error::UniqueViolation`] if any case already has
    /// an active row for `round`.
    async fn insert_ready(
        &self,
        case_ids: &[Uuid],
        round: Round,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Subset of `case_ids` that have a Ready or Assigned row for `round`.
    async fn active_case_ids(&self, case_ids: &[Uuid], round: Round) -> Result<Vec<Uuid>>;

    /// Create a Ready round-2 row unless the case already has an active
    /// round-2 row or a round-2 annotation.
    async fn ensure_second_round(&self, case_id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    /// Ready/Assigned rows of a case -> Skipped, lease fields cleared.
    async fn close_open_for_case(&self, case_id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    async fn list_for_case(&self, case_id: Uuid) -> Result<Vec<Assignment>>;
}

// =============================================================================
// ANNOTATIONS / EXTRACTIONS
// =============================================================================

/// Read access to submitted annotations. Writes happen only through
/// [`AssignmentRepository::submit`].
#[async_trait]
pub trait AnnotationRepository: Send + Sync {
    /// Most recently submitted annotation for a (case, round).
    async fn latest(&self, case_id: Uuid, round: Round) -> Result<Option<Annotation>>;

    async fn list_for_case(&self, case_id: Uuid) -> Result<Vec<Annotation>>;
}

#[async_trait]
pub trait ExtractionRepository: Send + Sync {
    async fn insert(&self, req: NewExtraction) -> Result<AutomatedExtraction>;

    /// Most recent extraction for a case by `created_at`.
    async fn latest(&self, case_id: Uuid) -> Result<Option<AutomatedExtraction>>;
}

/// Bulk read of converged data for the evaluation report.
#[async_trait]
pub trait EvaluationRepository: Send + Sync {
    /// One row per case. An empty `task_types` slice matches every task type.
    async fn load_rows(&self, task_types: &[String]) -> Result<Vec<EvaluationSourceRow>>;
}

// =============================================================================
// BUNDLE
// =============================================================================

/// The set of repositories the workflow runs against.
#[derive(Clone)]
pub struct Repositories {
    pub reviewers: Arc<dyn ReviewerRepository>,
    pub cases: Arc<dyn CaseRepository>,
    pub assignments: Arc<dyn AssignmentRepository>,
    pub annotations: Arc<dyn AnnotationRepository>,
    pub extractions: Arc<dyn ExtractionRepository>,
    pub evaluation: Arc<dyn EvaluationRepository>,
}
