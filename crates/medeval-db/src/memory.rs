//! In-memory implementation of every repository trait.
//!
//! All tables live behind one `RwLock`, and every trait method holds the write
//! lock (or read lock for pure reads) for its whole body. That gives each call
//! the same all-or-nothing conditional semantics the PostgreSQL store gets
//! from single guarded statements and transactions. Used by the workflow test
//! suites and for local runs without a database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use medeval_core::{
    new_v7, Annotation, AnnotationRepository, Assignment, AssignmentRepository, AssignmentStatus,
    AutomatedExtraction, Case, CaseRef, CaseRepository, CaseStatus, Error, EvaluationRepository,
    EvaluationSourceRow, ExtractionRepository, FinalizationSource, LeaseGuard, NewCase,
    NewExtraction, Repositories, Result, Reviewer, ReviewerRepository, Round, SubmitWrite,
};

/// Name reported when the active-assignment uniqueness rule rejects a write.
pub const ACTIVE_ASSIGNMENT_CONSTRAINT: &str = "idx_case_assignment_active";

#[derive(Default)]
struct Tables {
    reviewers: HashMap<Uuid, Reviewer>,
    cases: BTreeMap<Uuid, Case>,
    assignments: BTreeMap<Uuid, Assignment>,
    annotations: BTreeMap<Uuid, Annotation>,
    extractions: BTreeMap<Uuid, AutomatedExtraction>,
}

impl Tables {
    fn has_annotation(&self, case_id: Uuid, round: Round) -> bool {
        self.annotations
            .values()
            .any(|a| a.case_id == case_id && a.round == round)
    }

    fn has_active(&self, case_id: Uuid, round: Round) -> bool {
        self.assignments
            .values()
            .any(|a| a.case_id == case_id && a.round == round && a.status.is_active())
    }

    fn case_unfinalized(&self, case_id: Uuid) -> bool {
        self.cases
            .get(&case_id)
            .map(|c| c.final_gold_label.is_none())
            .unwrap_or(false)
    }

    fn latest_annotation(&self, case_id: Uuid, round: Round) -> Option<&Annotation> {
        self.annotations
            .values()
            .filter(|a| a.case_id == case_id && a.round == round)
            .max_by_key(|a| (a.submitted_at, a.id))
    }

    fn latest_extraction(&self, case_id: Uuid) -> Option<&AutomatedExtraction> {
        self.extractions
            .values()
            .filter(|e| e.case_id == case_id)
            .max_by_key(|e| (e.created_at, e.id))
    }

    fn new_ready(case_id: Uuid, round: Round, now: DateTime<Utc>) -> Assignment {
        Assignment {
            id: new_v7(),
            case_id,
            round,
            status: AssignmentStatus::Ready,
            reviewer_id: None,
            annotation_id: None,
            assigned_at: None,
            expires_at: None,
            last_seen_at: None,
            completed_at: None,
            attempt: 0,
            skip_reason: None,
            created_at: now,
        }
    }
}

fn held_live(a: &Assignment, reviewer_id: Uuid, now: DateTime<Utc>) -> bool {
    a.reviewer_id == Some(reviewer_id) && a.is_live(now)
}

fn reset_to_ready(a: &mut Assignment) {
    a.status = AssignmentStatus::Ready;
    a.reviewer_id = None;
    a.assigned_at = None;
    a.expires_at = None;
    a.last_seen_at = None;
    a.annotation_id = None;
    a.attempt += 1;
}

/// Shared in-memory store. Clones share the same tables.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle this store as every repository the workflow needs.
    pub fn repositories(&self) -> Repositories {
        Repositories {
            reviewers: Arc::new(self.clone()),
            cases: Arc::new(self.clone()),
            assignments: Arc::new(self.clone()),
            annotations: Arc::new(self.clone()),
            extractions: Arc::new(self.clone()),
            evaluation: Arc::new(self.clone()),
        }
    }

    /// Every assignment row, ordered by id.
    pub async fn all_assignments(&self) -> Vec<Assignment> {
        self.tables.read().await.assignments.values().cloned().collect()
    }

    /// Number of stored annotations.
    pub async fn annotation_count(&self) -> usize {
        self.tables.read().await.annotations.len()
    }
}

// =============================================================================
// REVIEWERS
// =============================================================================

#[async_trait]
impl ReviewerRepository for InMemoryStore {
    async fn ensure(&self, login_name: &str) -> Result<Reviewer> {
        let login = login_name.trim();
        if login.is_empty() {
            return Err(Error::InvalidInput("login name is empty".to_string()));
        }

        let mut t = self.tables.write().await;
        if let Some(existing) = t.reviewers.values().find(|r| r.login_name == login) {
            return Ok(existing.clone());
        }
        let reviewer = Reviewer {
            id: new_v7(),
            login_name: login.to_string(),
            display_name: login.to_string(),
            is_admin: false,
            created_at: Utc::now(),
        };
        t.reviewers.insert(reviewer.id, reviewer.clone());
        Ok(reviewer)
    }

    async fn find_by_login(&self, login_name: &str) -> Result<Option<Reviewer>> {
        let login = login_name.trim();
        let t = self.tables.read().await;
        Ok(t.reviewers.values().find(|r| r.login_name == login).cloned())
    }
}

// =============================================================================
// CASES
// =============================================================================

#[async_trait]
impl CaseRepository for InMemoryStore {
    async fn insert(&self, req: NewCase) -> Result<Case> {
        let case = Case {
            id: new_v7(),
            task_type: req.task_type,
            raw_text: req.raw_text,
            meta_info: req.meta_info,
            status: CaseStatus::Open,
            final_gold_label: None,
            finalized_by: None,
            finalization_source: None,
            finalized_at: None,
            adjudication_note: None,
            created_at: Utc::now(),
        };
        self.tables.write().await.cases.insert(case.id, case.clone());
        Ok(case)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Case>> {
        Ok(self.tables.read().await.cases.get(&id).cloned())
    }

    async fn list_unfinalized(
        &self,
        task_types: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<CaseRef>> {
        let t = self.tables.read().await;
        Ok(t.cases
            .values()
            .filter(|c| c.final_gold_label.is_none())
            .filter(|c| task_types.is_empty() || task_types.contains(&c.task_type))
            .take(limit.unwrap_or(usize::MAX))
            .map(|c| CaseRef {
                id: c.id,
                task_type: c.task_type.clone(),
            })
            .collect())
    }

    async fn seed_candidates(
        &self,
        task_type: &str,
        round: Round,
        exclude_seeded: bool,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        let t = self.tables.read().await;
        let seeded: HashSet<Uuid> = if exclude_seeded {
            t.assignments
                .values()
                .filter(|a| a.round == round)
                .map(|a| a.case_id)
                .collect()
        } else {
            HashSet::new()
        };
        Ok(t.cases
            .values()
            .filter(|c| c.task_type == task_type && c.final_gold_label.is_none())
            .filter(|c| !seeded.contains(&c.id))
            .take(limit)
            .map(|c| c.id)
            .collect())
    }

    async fn finalize_if_unset(
        &self,
        case_id: Uuid,
        label: &str,
        source: FinalizationSource,
        finalized_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut t = self.tables.write().await;
        match t.cases.get_mut(&case_id) {
            Some(case) if case.final_gold_label.is_none() => {
                case.final_gold_label = Some(label.to_string());
                case.finalization_source = Some(source);
                case.finalized_by = finalized_by;
                case.finalized_at = Some(now);
                case.status = CaseStatus::Finalized;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn mark_needs_adjudication(&self, case_id: Uuid) -> Result<u64> {
        let mut t = self.tables.write().await;
        match t.cases.get_mut(&case_id) {
            Some(case) if case.final_gold_label.is_none() => {
                case.status = CaseStatus::NeedsAdjudication;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn adjudicate(
        &self,
        case_id: Uuid,
        task_type: &str,
        label: &str,
        adjudicator_id: Uuid,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut t = self.tables.write().await;
        match t.cases.get_mut(&case_id) {
            Some(case)
                if case.final_gold_label.is_none()
                    && case.task_type.eq_ignore_ascii_case(task_type.trim()) =>
            {
                case.final_gold_label = Some(label.to_string());
                case.finalization_source = Some(FinalizationSource::Adjudication);
                case.finalized_by = Some(adjudicator_id);
                case.adjudication_note = note.map(String::from);
                case.finalized_at = Some(now);
                case.status = CaseStatus::Finalized;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn list_pending_adjudication(
        &self,
        task_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Case>> {
        let t = self.tables.read().await;
        Ok(t.cases
            .values()
            .filter(|c| c.status == CaseStatus::NeedsAdjudication && c.final_gold_label.is_none())
            .filter(|c| task_type.map_or(true, |tt| c.task_type.eq_ignore_ascii_case(tt)))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

// =============================================================================
// ASSIGNMENTS
// =============================================================================

#[async_trait]
impl AssignmentRepository for InMemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Assignment>> {
        Ok(self.tables.read().await.assignments.get(&id).cloned())
    }

    async fn find_live_for_reviewer(
        &self,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        let t = self.tables.read().await;
        Ok(t.assignments
            .values()
            .filter(|a| held_live(a, reviewer_id, now))
            .min_by_key(|a| (a.assigned_at, a.id))
            .cloned())
    }

    async fn next_candidate(
        &self,
        reviewer_id: Uuid,
        round: Round,
        excluded: &[Uuid],
    ) -> Result<Option<Assignment>> {
        let t = self.tables.read().await;
        let eligible = |a: &&Assignment| {
            if a.round != round
                || a.status != AssignmentStatus::Ready
                || a.reviewer_id.is_some()
                || excluded.contains(&a.id)
                || !t.case_unfinalized(a.case_id)
            {
                return false;
            }
            let own_annotation = t.annotations.values().any(|x| {
                x.case_id == a.case_id && x.round == round && x.reviewer_id == reviewer_id
            });
            if own_annotation {
                return false;
            }
            match round {
                Round::First => !t.has_annotation(a.case_id, Round::First),
                Round::Second => {
                    let self_review = t.annotations.values().any(|x| {
                        x.case_id == a.case_id
                            && x.round == Round::First
                            && x.reviewer_id == reviewer_id
                    });
                    t.has_annotation(a.case_id, Round::First)
                        && !t.has_annotation(a.case_id, Round::Second)
                        && !self_review
                }
            }
        };
        Ok(t.assignments
            .values()
            .filter(eligible)
            .min_by_key(|a| (a.attempt, a.id))
            .cloned())
    }

    async fn claim(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut t = self.tables.write().await;
        let case_open = match t.assignments.get(&id) {
            Some(a) => t.case_unfinalized(a.case_id),
            None => return Ok(0),
        };
        match t.assignments.get_mut(&id) {
            Some(a)
                if case_open && a.status == AssignmentStatus::Ready && a.reviewer_id.is_none() =>
            {
                a.status = AssignmentStatus::Assigned;
                a.reviewer_id = Some(reviewer_id);
                a.assigned_at = Some(now);
                a.last_seen_at = Some(now);
                a.expires_at = Some(expires_at);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn renew(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut t = self.tables.write().await;
        match t.assignments.get_mut(&id) {
            Some(a) if held_live(a, reviewer_id, now) => {
                a.expires_at = Some(expires_at);
                a.last_seen_at = Some(now);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn release_expired(&self, id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.write().await;
        match t.assignments.get_mut(&id) {
            Some(a) if a.is_expired(now) => {
                reset_to_ready(a);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn recycle_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.write().await;
        let mut count = 0;
        for a in t.assignments.values_mut().filter(|a| a.is_expired(now)) {
            reset_to_ready(a);
            count += 1;
        }
        Ok(count)
    }

    async fn submit(
        &self,
        guard: &LeaseGuard,
        annotation: &Annotation,
        now: DateTime<Utc>,
    ) -> Result<SubmitWrite> {
        let mut t = self.tables.write().await;

        let duplicate = t.annotations.values().any(|x| {
            x.case_id == annotation.case_id
                && x.reviewer_id == annotation.reviewer_id
                && x.round == annotation.round
        });
        if duplicate {
            return Ok(SubmitWrite::DuplicateAnnotation);
        }

        let Some(a) = t.assignments.get_mut(&guard.assignment_id) else {
            return Ok(SubmitWrite::LeaseLost);
        };
        if a.case_id != guard.case_id || !held_live(a, guard.reviewer_id, now) {
            return Ok(SubmitWrite::LeaseLost);
        }

        a.status = AssignmentStatus::Submitted;
        a.completed_at = Some(now);
        a.last_seen_at = Some(now);
        a.expires_at = None;
        a.annotation_id = Some(annotation.id);
        t.annotations.insert(annotation.id, annotation.clone());
        Ok(SubmitWrite::Committed)
    }

    async fn skip(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut t = self.tables.write().await;
        match t.assignments.get_mut(&id) {
            Some(a) if held_live(a, reviewer_id, now) => {
                a.status = AssignmentStatus::Skipped;
                a.completed_at = Some(now);
                a.last_seen_at = Some(now);
                a.expires_at = None;
                a.skip_reason = reason.map(String::from);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn insert_ready(
        &self,
        case_ids: &[Uuid],
        round: Round,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut t = self.tables.write().await;

        let mut batch = HashSet::new();
        for case_id in case_ids {
            if !batch.insert(*case_id) || t.has_active(*case_id, round) {
                return Err(Error::UniqueViolation(
                    ACTIVE_ASSIGNMENT_CONSTRAINT.to_string(),
                ));
            }
            if !t.cases.contains_key(case_id) {
                return Err(Error::NotFound(format!("case {case_id}")));
            }
        }

        for case_id in case_ids {
            let row = Tables::new_ready(*case_id, round, now);
            t.assignments.insert(row.id, row);
        }
        Ok(case_ids.len() as u64)
    }

    async fn active_case_ids(&self, case_ids: &[Uuid], round: Round) -> Result<Vec<Uuid>> {
        let t = self.tables.read().await;
        let mut active: Vec<Uuid> = case_ids
            .iter()
            .copied()
            .filter(|id| t.has_active(*id, round))
            .collect();
        active.sort();
        active.dedup();
        Ok(active)
    }

    async fn ensure_second_round(&self, case_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.write().await;
        if !t.case_unfinalized(case_id)
            || t.has_annotation(case_id, Round::Second)
            || t.has_active(case_id, Round::Second)
        {
            return Ok(0);
        }
        let row = Tables::new_ready(case_id, Round::Second, now);
        t.assignments.insert(row.id, row);
        Ok(1)
    }

    async fn close_open_for_case(&self, case_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.write().await;
        let mut count = 0;
        for a in t
            .assignments
            .values_mut()
            .filter(|a| a.case_id == case_id && a.status.is_active())
        {
            a.status = AssignmentStatus::Skipped;
            a.completed_at = Some(now);
            a.reviewer_id = None;
            a.assigned_at = None;
            a.expires_at = None;
            a.last_seen_at = None;
            if a.skip_reason.is_none() {
                a.skip_reason = Some("closed by adjudication".to_string());
            }
            count += 1;
        }
        Ok(count)
    }

    async fn list_for_case(&self, case_id: Uuid) -> Result<Vec<Assignment>> {
        let t = self.tables.read().await;
        let mut rows: Vec<Assignment> = t
            .assignments
            .values()
            .filter(|a| a.case_id == case_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.round, a.created_at, a.id));
        Ok(rows)
    }
}

// =============================================================================
// ANNOTATIONS / EXTRACTIONS / EVALUATION
// =============================================================================

#[async_trait]
impl AnnotationRepository for InMemoryStore {
    async fn latest(&self, case_id: Uuid, round: Round) -> Result<Option<Annotation>> {
        let t = self.tables.read().await;
        Ok(t.latest_annotation(case_id, round).cloned())
    }

    async fn list_for_case(&self, case_id: Uuid) -> Result<Vec<Annotation>> {
        let t = self.tables.read().await;
        let mut rows: Vec<Annotation> = t
            .annotations
            .values()
            .filter(|a| a.case_id == case_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.round, a.submitted_at, a.id));
        Ok(rows)
    }
}

#[async_trait]
impl ExtractionRepository for InMemoryStore {
    async fn insert(&self, req: NewExtraction) -> Result<AutomatedExtraction> {
        let mut t = self.tables.write().await;
        if !t.cases.contains_key(&req.case_id) {
            return Err(Error::NotFound(format!("case {}", req.case_id)));
        }
        let extraction = AutomatedExtraction {
            id: new_v7(),
            case_id: req.case_id,
            parsed_value: req.parsed_value,
            parsed_successfully: req.parsed_successfully,
            raw_response: req.raw_response,
            error_code: req.error_code,
            created_at: req.created_at,
        };
        t.extractions.insert(extraction.id, extraction.clone());
        Ok(extraction)
    }

    async fn latest(&self, case_id: Uuid) -> Result<Option<AutomatedExtraction>> {
        let t = self.tables.read().await;
        Ok(t.latest_extraction(case_id).cloned())
    }
}

#[async_trait]
impl EvaluationRepository for InMemoryStore {
    async fn load_rows(&self, task_types: &[String]) -> Result<Vec<EvaluationSourceRow>> {
        let t = self.tables.read().await;
        Ok(t.cases
            .values()
            .filter(|c| {
                task_types.is_empty()
                    || task_types
                        .iter()
                        .any(|tt| tt.trim().eq_ignore_ascii_case(&c.task_type))
            })
            .map(|c| {
                let extraction = t.latest_extraction(c.id);
                EvaluationSourceRow {
                    case_id: c.id,
                    task_type: c.task_type.clone(),
                    automated: extraction.map(|e| e.parsed_value.clone()),
                    automated_parsed_ok: extraction.map(|e| e.parsed_successfully).unwrap_or(false),
                    round1: t
                        .latest_annotation(c.id, Round::First)
                        .map(|a| a.value.clone()),
                    round2: t
                        .latest_annotation(c.id, Round::Second)
                        .map(|a| a.value.clone()),
                    gold: c.final_gold_label.clone(),
                }
            })
            .collect())
    }
}
