//! Reviewer-facing acquire/heartbeat/submit/skip protocol.
//!
//! Every state change goes through a guarded lease store transition. A zero
//! row count means the caller lost a race and is turned into a retry (acquire)
//! or a typed outcome (heartbeat, submit, skip), never an error.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use medeval_core::defaults::{LEASE_DURATION_MINUTES, MAX_CLAIM_ATTEMPTS};
use medeval_core::{
    looks_like_refusal, new_v7, AcquireCaseResponse, Annotation, AssignmentStatus,
    HeartbeatResponse, LabelNormalizer, LeaseGuard, Repositories, Result, Round,
    SubmitAnnotationRequest, SubmitAnnotationResponse, SubmitStatus, SubmitWrite,
};

use crate::config::WorkflowConfig;

const MSG_EXPIRED: &str = "Assignment expired. Please reload and get a new case.";
const MSG_INACTIVE: &str = "Assignment is no longer active. Please reload.";

/// Decides which case each reviewer works on next and guards every write to
/// that reviewer's lease.
#[derive(Clone)]
pub struct AssignmentArbiter {
    repos: Repositories,
    normalizer: LabelNormalizer,
    lease_duration: Duration,
    escalate_on_submit: bool,
}

impl AssignmentArbiter {
    pub fn new(repos: Repositories) -> Self {
        Self {
            repos,
            normalizer: LabelNormalizer::default(),
            lease_duration: Duration::minutes(LEASE_DURATION_MINUTES),
            escalate_on_submit: false,
        }
    }

    pub fn from_config(repos: Repositories, config: &WorkflowConfig) -> Self {
        Self::new(repos)
            .with_lease_duration(config.lease_duration())
            .with_normalizer(config.normalizer())
            .with_escalate_on_submit(config.escalate_on_submit)
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_normalizer(mut self, normalizer: LabelNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Open round 2 immediately when a round-1 submission disagrees with the
    /// automated output.
    pub fn with_escalate_on_submit(mut self, enabled: bool) -> Self {
        self.escalate_on_submit = enabled;
        self
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    // =========================================================================
    // ACQUIRE
    // =========================================================================

    /// Hand the reviewer a case: their live lease (renewed) if they hold one,
    /// otherwise a freshly claimed Ready row, round 2 before round 1.
    pub async fn acquire(&self, login_name: &str) -> Result<Option<AcquireCaseResponse>> {
        self.acquire_at(login_name, Utc::now()).await
    }

    pub async fn acquire_at(
        &self,
        login_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AcquireCaseResponse>> {
        let login_name = login_name.trim();
        if login_name.is_empty() {
            return Ok(None);
        }

        let reviewer = self.repos.reviewers.ensure(login_name).await?;
        let recycled = self.repos.assignments.recycle_expired(now).await?;
        if recycled > 0 {
            debug!(
                subsystem = "workflow",
                component = "arbiter",
                op = "acquire",
                recycled,
                "Reclaimed expired leases before acquire"
            );
        }

        let expires_at = now + self.lease_duration;

        if let Some(existing) = self
            .repos
            .assignments
            .find_live_for_reviewer(reviewer.id, now)
            .await?
        {
            let renewed = self
                .repos
                .assignments
                .renew(existing.id, reviewer.id, now, expires_at)
                .await?;
            if renewed == 1 {
                if let Some(resp) = self.build_response(existing.id, now).await? {
                    debug!(
                        subsystem = "workflow",
                        component = "arbiter",
                        op = "acquire",
                        assignment_id = %existing.id,
                        reviewer_id = %reviewer.id,
                        "Returning renewed lease"
                    );
                    return Ok(Some(resp));
                }
            }
            debug!(
                subsystem = "workflow",
                component = "arbiter",
                op = "acquire",
                assignment_id = %existing.id,
                "Live lease lapsed before renewal, claiming new work"
            );
        }

        for round in [Round::Second, Round::First] {
            if let Some(resp) = self.try_claim(reviewer.id, round, now, expires_at).await? {
                return Ok(Some(resp));
            }
        }

        debug!(
            subsystem = "workflow",
            component = "arbiter",
            op = "acquire",
            reviewer_id = %reviewer.id,
            "No claimable work"
        );
        Ok(None)
    }

    /// Claim the best Ready row of one round, moving past rows lost to other
    /// reviewers.
    async fn try_claim(
        &self,
        reviewer_id: Uuid,
        round: Round,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<AcquireCaseResponse>> {
        let mut excluded: Vec<Uuid> = Vec::new();

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let Some(candidate) = self
                .repos
                .assignments
                .next_candidate(reviewer_id, round, &excluded)
                .await?
            else {
                return Ok(None);
            };

            let claimed = self
                .repos
                .assignments
                .claim(candidate.id, reviewer_id, now, expires_at)
                .await?;
            if claimed == 1 {
                info!(
                    subsystem = "workflow",
                    component = "arbiter",
                    op = "acquire",
                    assignment_id = %candidate.id,
                    case_id = %candidate.case_id,
                    reviewer_id = %reviewer_id,
                    round = round.as_i16(),
                    attempt = candidate.attempt,
                    "Lease granted"
                );
                return self.build_response(candidate.id, now).await;
            }

            debug!(
                subsystem = "workflow",
                component = "arbiter",
                op = "acquire",
                assignment_id = %candidate.id,
                round = round.as_i16(),
                "Lost claim race, trying next candidate"
            );
            excluded.push(candidate.id);
        }

        warn!(
            subsystem = "workflow",
            component = "arbiter",
            op = "acquire",
            round = round.as_i16(),
            attempts = MAX_CLAIM_ATTEMPTS,
            "Claim attempts exhausted"
        );
        Ok(None)
    }

    async fn build_response(
        &self,
        assignment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AcquireCaseResponse>> {
        let Some(assignment) = self.repos.assignments.get(assignment_id).await? else {
            return Ok(None);
        };
        let Some(case) = self.repos.cases.get(assignment.case_id).await? else {
            return Ok(None);
        };

        Ok(Some(AcquireCaseResponse {
            assignment_id: assignment.id,
            case_id: case.id,
            task_type: case.task_type,
            raw_text: case.raw_text,
            meta_info: case.meta_info,
            round: assignment.round,
            assigned_at: assignment.assigned_at.unwrap_or(now),
            expires_at: assignment
                .expires_at
                .unwrap_or(now + self.lease_duration),
        }))
    }

    // =========================================================================
    // HEARTBEAT
    // =========================================================================

    /// Extend a held, unexpired lease. Never mutates anything otherwise.
    pub async fn heartbeat(
        &self,
        login_name: &str,
        assignment_id: Uuid,
    ) -> Result<HeartbeatResponse> {
        self.heartbeat_at(login_name, assignment_id, Utc::now()).await
    }

    pub async fn heartbeat_at(
        &self,
        login_name: &str,
        assignment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse> {
        let Some(reviewer) = self.repos.reviewers.find_by_login(login_name.trim()).await? else {
            return Ok(HeartbeatResponse {
                ok: false,
                new_expiry: None,
                message: Some("Reviewer not found.".to_string()),
            });
        };

        let new_expiry = now + self.lease_duration;
        let renewed = self
            .repos
            .assignments
            .renew(assignment_id, reviewer.id, now, new_expiry)
            .await?;

        if renewed != 1 {
            debug!(
                subsystem = "workflow",
                component = "arbiter",
                op = "heartbeat",
                assignment_id = %assignment_id,
                "Heartbeat on inactive lease"
            );
            return Ok(HeartbeatResponse {
                ok: false,
                new_expiry: None,
                message: Some(
                    "Assignment not active (expired, not owned or not assigned).".to_string(),
                ),
            });
        }

        Ok(HeartbeatResponse {
            ok: true,
            new_expiry: Some(new_expiry),
            message: None,
        })
    }

    // =========================================================================
    // SUBMIT
    // =========================================================================

    /// Store the reviewer's annotation and close their lease.
    ///
    /// Idempotent on an already Submitted assignment, including a duplicate
    /// submit that races the first one. An expired lease is returned to Ready
    /// and reported as [`SubmitStatus::Expired`].
    pub async fn submit(
        &self,
        login_name: &str,
        req: &SubmitAnnotationRequest,
    ) -> Result<SubmitAnnotationResponse> {
        self.submit_at(login_name, req, Utc::now()).await
    }

    pub async fn submit_at(
        &self,
        login_name: &str,
        req: &SubmitAnnotationRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitAnnotationResponse> {
        let Some(reviewer) = self.repos.reviewers.find_by_login(login_name.trim()).await? else {
            return Ok(reject("Reviewer not found."));
        };

        let Some(assignment) = self.repos.assignments.get(req.assignment_id).await? else {
            return Ok(reject("Invalid assignment."));
        };

        if assignment.status == AssignmentStatus::Submitted {
            return Ok(already_submitted());
        }

        if assignment.case_id != req.case_id {
            return Ok(reject("Case does not match the assignment."));
        }
        if assignment.reviewer_id != Some(reviewer.id) {
            return Ok(SubmitAnnotationResponse::new(
                SubmitStatus::Inactive,
                "Invalid or no longer active assignment.",
            ));
        }

        if assignment.is_expired(now) {
            return self.expire(assignment.id, reviewer.id, now).await;
        }
        if !assignment.is_live(now) {
            return Ok(SubmitAnnotationResponse::new(
                SubmitStatus::Inactive,
                "Invalid or no longer active assignment.",
            ));
        }

        let Some(case) = self.repos.cases.get(req.case_id).await? else {
            return Ok(reject("Case not found."));
        };
        if !case.task_type.eq_ignore_ascii_case(req.task_type.trim()) {
            return Ok(reject("Task type mismatch."));
        }
        for (name, score) in [("Difficulty", req.difficulty), ("Confidence", req.confidence)] {
            if matches!(score, Some(s) if !(1..=5).contains(&s)) {
                return Ok(reject(format!("{name} must be between 1 and 5.")));
            }
        }

        let annotation = Annotation {
            id: new_v7(),
            case_id: case.id,
            task_type: case.task_type.clone(),
            value: req.value.trim().to_string(),
            uncertainty: req
                .note
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from),
            reviewer_id: reviewer.id,
            round: assignment.round,
            started_at: req.started_at,
            submitted_at: req.submitted_at,
            created_at: req.submitted_at,
            difficulty_score: req.difficulty,
            confidence_score: req.confidence,
        };
        let guard = LeaseGuard {
            assignment_id: assignment.id,
            case_id: case.id,
            reviewer_id: reviewer.id,
        };

        match self.repos.assignments.submit(&guard, &annotation, now).await? {
            SubmitWrite::Committed => {
                info!(
                    subsystem = "workflow",
                    component = "arbiter",
                    op = "submit",
                    assignment_id = %assignment.id,
                    case_id = %case.id,
                    reviewer_id = %reviewer.id,
                    round = assignment.round.as_i16(),
                    "Annotation saved"
                );
                let mut resp = SubmitAnnotationResponse::new(SubmitStatus::Saved, "Saved.");
                if assignment.round == Round::First && self.escalate_on_submit {
                    resp.triggered_second_round = self
                        .escalate_if_disagrees(&case.task_type, case.id, &annotation.value, now)
                        .await;
                }
                Ok(resp)
            }
            SubmitWrite::LeaseLost => {
                let current = self.repos.assignments.get(assignment.id).await?;
                match current {
                    Some(a) if a.status == AssignmentStatus::Submitted => Ok(already_submitted()),
                    Some(a) if a.is_expired(now) => {
                        self.expire(assignment.id, reviewer.id, now).await
                    }
                    _ => {
                        debug!(
                            subsystem = "workflow",
                            component = "arbiter",
                            op = "submit",
                            assignment_id = %assignment.id,
                            "Lease lost during submit"
                        );
                        Ok(SubmitAnnotationResponse::new(SubmitStatus::Inactive, MSG_INACTIVE))
                    }
                }
            }
            SubmitWrite::DuplicateAnnotation => {
                // A concurrent submit for the same lease committed first.
                let submitted = self
                    .repos
                    .assignments
                    .get(assignment.id)
                    .await?
                    .is_some_and(|a| a.status == AssignmentStatus::Submitted);
                if submitted {
                    debug!(
                        subsystem = "workflow",
                        component = "arbiter",
                        op = "submit",
                        assignment_id = %assignment.id,
                        "Concurrent submit already committed"
                    );
                    return Ok(already_submitted());
                }
                Ok(reject("An annotation for this case and round already exists."))
            }
        }
    }

    async fn expire(
        &self,
        assignment_id: Uuid,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SubmitAnnotationResponse> {
        let released = self
            .repos
            .assignments
            .release_expired(assignment_id, now)
            .await?;
        warn!(
            subsystem = "workflow",
            component = "arbiter",
            op = "submit",
            assignment_id = %assignment_id,
            reviewer_id = %reviewer_id,
            rows_affected = released,
            "Submit on expired lease, returned to Ready"
        );
        Ok(SubmitAnnotationResponse::new(SubmitStatus::Expired, MSG_EXPIRED))
    }

    /// Best effort: the annotation is already committed, so failures here are
    /// logged and left for the next QC scan.
    async fn escalate_if_disagrees(
        &self,
        task_type: &str,
        case_id: Uuid,
        round1_value: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let extraction = match self.repos.extractions.latest(case_id).await {
            Ok(Some(e)) if e.parsed_successfully && !looks_like_refusal(&e.parsed_value) => e,
            Ok(_) => return false,
            Err(e) => {
                warn!(
                    subsystem = "workflow",
                    component = "arbiter",
                    case_id = %case_id,
                    error = %e,
                    "Failed to load extraction for submit escalation"
                );
                return false;
            }
        };

        if self.normalizer.equals(
            task_type,
            Some(extraction.parsed_value.as_str()),
            Some(round1_value),
        ) {
            return false;
        }

        match self.repos.assignments.ensure_second_round(case_id, now).await {
            Ok(created) => {
                if created == 1 {
                    info!(
                        subsystem = "workflow",
                        component = "arbiter",
                        case_id = %case_id,
                        "Round 1 disagrees with automated output, round 2 opened"
                    );
                }
                created == 1
            }
            Err(e) => {
                warn!(
                    subsystem = "workflow",
                    component = "arbiter",
                    case_id = %case_id,
                    error = %e,
                    "Failed to open round 2 at submit"
                );
                false
            }
        }
    }

    // =========================================================================
    // SKIP
    // =========================================================================

    /// Close a held, unexpired lease without an annotation.
    pub async fn skip(
        &self,
        login_name: &str,
        assignment_id: Uuid,
        reason: Option<&str>,
    ) -> Result<bool> {
        self.skip_at(login_name, assignment_id, reason, Utc::now()).await
    }

    pub async fn skip_at(
        &self,
        login_name: &str,
        assignment_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(reviewer) = self.repos.reviewers.find_by_login(login_name.trim()).await? else {
            return Ok(false);
        };
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        let skipped = self
            .repos
            .assignments
            .skip(assignment_id, reviewer.id, reason, now)
            .await?;
        if skipped == 1 {
            info!(
                subsystem = "workflow",
                component = "arbiter",
                op = "skip",
                assignment_id = %assignment_id,
                reviewer_id = %reviewer.id,
                "Assignment skipped"
            );
        }
        Ok(skipped == 1)
    }
}

fn already_submitted() -> SubmitAnnotationResponse {
    SubmitAnnotationResponse::new(SubmitStatus::AlreadySubmitted, "Already submitted.")
}

fn reject(message: impl Into<String>) -> SubmitAnnotationResponse {
    SubmitAnnotationResponse::new(SubmitStatus::Rejected, message)
}
