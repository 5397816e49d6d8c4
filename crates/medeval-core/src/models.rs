//! Domain models and request/response types for the annotation workflow.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// ENUMS
// =============================================================================

/// State of an assignment row in the lease state machine.
///
/// `Ready` and `Assigned` are the active states; at most one active row may
/// exist per (case, round). `Submitted` and `Skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Claimable, no holder.
    Ready,
    /// Leased to a reviewer until `expires_at`.
    Assigned,
    /// The holder submitted an annotation.
    Submitted,
    /// The holder (or an adjudicator) closed the row without an annotation.
    Skipped,
}

impl AssignmentStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Ready => "ready",
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::Submitted => "submitted",
            AssignmentStatus::Skipped => "skipped",
        }
    }

    /// Ready or Assigned.
    pub fn is_active(&self) -> bool {
        matches!(self, AssignmentStatus::Ready | AssignmentStatus::Assigned)
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(AssignmentStatus::Ready),
            "assigned" => Ok(AssignmentStatus::Assigned),
            "submitted" => Ok(AssignmentStatus::Submitted),
            "skipped" => Ok(AssignmentStatus::Skipped),
            other => Err(Error::InvalidInput(format!(
                "unknown assignment status: {other}"
            ))),
        }
    }
}

/// Human review round. Adjudication is handled out of band and has no round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum Round {
    /// Initial review.
    First,
    /// Second reviewer, for disagreements and audit samples.
    Second,
}

impl Round {
    /// Database representation (1 or 2).
    pub fn as_i16(self) -> i16 {
        match self {
            Round::First => 1,
            Round::Second => 2,
        }
    }
}

impl TryFrom<i16> for Round {
    type Error = Error;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Round::First),
            2 => Ok(Round::Second),
            other => Err(Error::InvalidInput(format!("invalid round: {other}"))),
        }
    }
}

impl From<Round> for i16 {
    fn from(round: Round) -> Self {
        round.as_i16()
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i16())
    }
}

/// Convergence state of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// Still collecting judgments.
    Open,
    /// Round 1 and round 2 disagree; waiting on manual adjudication.
    NeedsAdjudication,
    /// Gold label set.
    Finalized,
}

impl CaseStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Open => "open",
            CaseStatus::NeedsAdjudication => "needs_adjudication",
            CaseStatus::Finalized => "finalized",
        }
    }
}

impl FromStr for CaseStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(CaseStatus::Open),
            "needs_adjudication" => Ok(CaseStatus::NeedsAdjudication),
            "finalized" => Ok(CaseStatus::Finalized),
            other => Err(Error::InvalidInput(format!("unknown case status: {other}"))),
        }
    }
}

/// Which path produced a case's gold label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationSource {
    /// Automated output matched round 1 and the case was not audited.
    AutoConfirm,
    /// Round 1 and round 2 agreed.
    Agreement,
    /// Set manually by an adjudicator.
    Adjudication,
}

impl FinalizationSource {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizationSource::AutoConfirm => "auto_confirm",
            FinalizationSource::Agreement => "agreement",
            FinalizationSource::Adjudication => "adjudication",
        }
    }
}

impl FromStr for FinalizationSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_confirm" => Ok(FinalizationSource::AutoConfirm),
            "agreement" => Ok(FinalizationSource::Agreement),
            "adjudication" => Ok(FinalizationSource::Adjudication),
            other => Err(Error::InvalidInput(format!(
                "unknown finalization source: {other}"
            ))),
        }
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

/// A unit of annotation work: one report for one extraction task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: Uuid,
    pub task_type: String,
    pub raw_text: String,
    pub meta_info: Option<String>,
    pub status: CaseStatus,
    /// Write-once gold label.
    pub final_gold_label: Option<String>,
    /// Adjudicator who set the label; `None` for algorithmic finalization.
    pub finalized_by: Option<Uuid>,
    pub finalization_source: Option<FinalizationSource>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub adjudication_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Case {
    pub fn is_finalized(&self) -> bool {
        self.final_gold_label.is_some()
    }
}

/// Case creation request (used by ingestion and fixtures).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCase {
    pub task_type: String,
    pub raw_text: String,
    pub meta_info: Option<String>,
}

/// Minimal projection used by scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRef {
    pub id: Uuid,
    pub task_type: String,
}

/// An identity capable of holding assignments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reviewer {
    pub id: Uuid,
    pub login_name: String,
    pub display_name: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

/// The lease record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub case_id: Uuid,
    pub round: Round,
    pub status: AssignmentStatus,
    /// Current holder; cleared when the lease is reclaimed.
    pub reviewer_id: Option<Uuid>,
    pub annotation_id: Option<Uuid>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Incremented every time an expired lease is reclaimed.
    pub attempt: i32,
    pub skip_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Assignment {
    /// Assigned and not yet expired at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == AssignmentStatus::Assigned
            && self.expires_at.map(|e| e > now).unwrap_or(false)
    }

    /// Assigned but past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == AssignmentStatus::Assigned
            && self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

/// One reviewer's immutable judgment for one (case, round).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub case_id: Uuid,
    pub task_type: String,
    pub value: String,
    pub uncertainty: Option<String>,
    pub reviewer_id: Uuid,
    pub round: Round,
    pub started_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Self-rated difficulty, 1-5.
    pub difficulty_score: Option<i16>,
    /// Self-rated confidence, 1-5.
    pub confidence_score: Option<i16>,
}

/// Parsed output of an external extraction model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomatedExtraction {
    pub id: Uuid,
    pub case_id: Uuid,
    pub parsed_value: String,
    pub parsed_successfully: bool,
    pub raw_response: String,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Extraction creation request (written by the external model runner).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExtraction {
    pub case_id: Uuid,
    pub parsed_value: String,
    pub parsed_successfully: bool,
    pub raw_response: String,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// LEASE STORE TYPES
// =============================================================================

/// Expected identity of an assignment row for holder-guarded transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGuard {
    pub assignment_id: Uuid,
    pub case_id: Uuid,
    pub reviewer_id: Uuid,
}

/// Outcome of the transactional annotation write + Submitted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitWrite {
    /// Annotation stored and assignment marked Submitted.
    Committed,
    /// The guarded transition matched no row; everything was rolled back.
    LeaseLost,
    /// The reviewer already has an annotation for this (case, round); rolled back.
    DuplicateAnnotation,
}

// =============================================================================
// WORKFLOW REQUESTS / RESPONSES
// =============================================================================

/// Work handed to a reviewer by acquire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireCaseResponse {
    pub assignment_id: Uuid,
    pub case_id: Uuid,
    pub task_type: String,
    pub raw_text: String,
    pub meta_info: Option<String>,
    pub round: Round,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub new_expiry: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAnnotationRequest {
    pub assignment_id: Uuid,
    pub case_id: Uuid,
    pub task_type: String,
    pub value: String,
    pub note: Option<String>,
    pub started_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub difficulty: Option<i16>,
    pub confidence: Option<i16>,
}

/// Machine-readable submit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    /// Annotation stored.
    Saved,
    /// The assignment was already Submitted; nothing changed.
    AlreadySubmitted,
    /// The lease had expired; the row was returned to Ready. Reacquire.
    Expired,
    /// The lease is no longer held by the caller (lost race, wrong holder).
    Inactive,
    /// Validation failed (unknown reviewer/assignment/case, task-type mismatch).
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAnnotationResponse {
    pub ok: bool,
    pub status: SubmitStatus,
    pub message: String,
    /// A round-2 assignment was opened as a direct result of this submission.
    pub triggered_second_round: bool,
}

impl SubmitAnnotationResponse {
    pub fn new(status: SubmitStatus, message: impl Into<String>) -> Self {
        Self {
            ok: matches!(status, SubmitStatus::Saved | SubmitStatus::AlreadySubmitted),
            status,
            message: message.into(),
            triggered_second_round: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedAssignmentsRequest {
    pub per_task_type_count: usize,
    pub task_types: Vec<String>,
    pub round: Round,
    pub exclude_already_seeded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPerTaskTypeResult {
    pub task_type: String,
    pub requested: usize,
    pub created: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedAssignmentsResult {
    pub requested_total: usize,
    pub created_total: usize,
    pub per_task_type: Vec<SeedPerTaskTypeResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcProgressRequest {
    /// Empty means every task type.
    pub task_types: Vec<String>,
    pub max_cases: Option<usize>,
    pub audit_rate: f64,
    pub create_audit_assignments: bool,
    /// Seed for audit sampling; `None` draws from OS entropy.
    pub rng_seed: Option<u64>,
}

impl Default for QcProgressRequest {
    fn default() -> Self {
        Self {
            task_types: Vec::new(),
            max_cases: None,
            audit_rate: crate::defaults::QC_AUDIT_RATE,
            create_audit_assignments: true,
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcProgressResult {
    pub scanned: usize,
    pub auto_confirmed: usize,
    pub sent_to_round2: usize,
    pub audited: usize,
    pub finalized_by_agreement: usize,
    pub needs_adjudication: usize,
    pub skipped_missing: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicationRequest {
    pub case_id: Uuid,
    pub task_type: String,
    pub final_label: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicationResult {
    pub ok: bool,
    pub message: String,
}

/// A case waiting on manual adjudication, with everything an adjudicator needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAdjudicationItem {
    pub case_id: Uuid,
    pub task_type: String,
    pub raw_text: String,
    pub meta_info: Option<String>,
    pub automated_value: Option<String>,
    pub round1_value: String,
    pub round2_value: String,
    pub round1_submitted_at: Option<DateTime<Utc>>,
    pub round2_submitted_at: Option<DateTime<Utc>>,
}

/// Raw, unnormalized per-case values feeding the evaluation report.
///
/// Uses the latest extraction per case and the latest annotation per
/// (case, round).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSourceRow {
    pub case_id: Uuid,
    pub task_type: String,
    pub automated: Option<String>,
    pub automated_parsed_ok: bool,
    pub round1: Option<String>,
    pub round2: Option<String>,
    pub gold: Option<String>,
}
