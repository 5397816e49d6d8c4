//! QC convergence: drives each case toward a gold label.
//!
//! Pass 1 compares the latest automated extraction with round 1 and either
//! auto-confirms, audits, or escalates to round 2. Pass 2 resolves cases whose
//! round-2 annotation has landed: agreement finalizes, disagreement marks the
//! case for adjudication. Every gold-label write is guarded by "still unset",
//! so re-running a scan is a no-op for finalized cases.

use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace};
use uuid::Uuid;

use medeval_core::{
    looks_like_refusal, AdjudicationRequest, AdjudicationResult, CaseRef, FinalizationSource,
    LabelNormalizer, PendingAdjudicationItem, QcProgressRequest, QcProgressResult, Repositories,
    Result, Round,
};

/// What pass 1 decided for one case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FirstPass {
    Missing,
    SentToRound2,
    Audited,
    AutoConfirmed,
    /// Matched, but round 2 is open or already answered; pass 2 decides.
    AwaitingRound2,
    /// Matched, but another writer finalized the case first.
    AlreadyFinal,
}

#[derive(Clone)]
pub struct QcPipeline {
    repos: Repositories,
    normalizer: LabelNormalizer,
}

impl QcPipeline {
    pub fn new(repos: Repositories) -> Self {
        Self {
            repos,
            normalizer: LabelNormalizer::default(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: LabelNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Run both passes. Audit sampling uses `req.rng_seed` when set.
    pub async fn run(&self, req: &QcProgressRequest) -> Result<QcProgressResult> {
        let mut rng = match req.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.run_with_rng(req, &mut rng, Utc::now()).await
    }

    /// Run both passes with an injected randomness source and clock.
    pub async fn run_with_rng<R>(
        &self,
        req: &QcProgressRequest,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Result<QcProgressResult>
    where
        R: Rng + Send,
    {
        let start = Instant::now();
        let audit_rate = if req.create_audit_assignments && req.audit_rate.is_finite() {
            req.audit_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut progress = QcProgressResult::default();

        let cases = self
            .repos
            .cases
            .list_unfinalized(&req.task_types, req.max_cases.filter(|m| *m > 0))
            .await?;

        for case in &cases {
            progress.scanned += 1;
            match self.first_pass(case, rng, audit_rate, now).await? {
                FirstPass::Missing => progress.skipped_missing += 1,
                FirstPass::SentToRound2 => progress.sent_to_round2 += 1,
                FirstPass::Audited => progress.audited += 1,
                FirstPass::AutoConfirmed => progress.auto_confirmed += 1,
                FirstPass::AwaitingRound2 | FirstPass::AlreadyFinal => {}
            }
        }

        let remaining = self
            .repos
            .cases
            .list_unfinalized(&req.task_types, None)
            .await?;

        for case in &remaining {
            let r1 = self.repos.annotations.latest(case.id, Round::First).await?;
            let r2 = self.repos.annotations.latest(case.id, Round::Second).await?;
            let (Some(r1), Some(r2)) = (r1, r2) else {
                continue;
            };

            let r1n = self.normalize(&case.task_type, &r1.value);
            let r2n = self.normalize(&case.task_type, &r2.value);

            if r1n == r2n {
                let updated = self
                    .repos
                    .cases
                    .finalize_if_unset(case.id, &r1n, FinalizationSource::Agreement, None, now)
                    .await?;
                if updated == 1 {
                    progress.finalized_by_agreement += 1;
                }
            } else {
                self.repos.cases.mark_needs_adjudication(case.id).await?;
                progress.needs_adjudication += 1;
                debug!(
                    subsystem = "workflow",
                    component = "qc",
                    case_id = %case.id,
                    "Round 1 and round 2 disagree, needs adjudication"
                );
            }
        }

        info!(
            subsystem = "workflow",
            component = "qc",
            op = "run",
            scanned = progress.scanned,
            auto_confirmed = progress.auto_confirmed,
            sent_to_round2 = progress.sent_to_round2,
            audited = progress.audited,
            finalized_by_agreement = progress.finalized_by_agreement,
            needs_adjudication = progress.needs_adjudication,
            skipped_missing = progress.skipped_missing,
            duration_ms = start.elapsed().as_millis() as u64,
            "QC scan completed"
        );

        Ok(progress)
    }

    /// Randomness is drawn only for matching cases, and only when
    /// `audit_rate` is positive.
    async fn first_pass<R>(
        &self,
        case: &CaseRef,
        rng: &mut R,
        audit_rate: f64,
        now: DateTime<Utc>,
    ) -> Result<FirstPass>
    where
        R: Rng + Send,
    {
        let extraction = self.repos.extractions.latest(case.id).await?;
        let r1 = self.repos.annotations.latest(case.id, Round::First).await?;

        let (Some(extraction), Some(r1)) = (extraction, r1) else {
            trace!(case_id = %case.id, "Missing extraction or round 1");
            return Ok(FirstPass::Missing);
        };
        if !extraction.parsed_successfully || looks_like_refusal(&extraction.parsed_value) {
            trace!(case_id = %case.id, "Unusable automated output");
            return Ok(FirstPass::Missing);
        }

        let automated = self.normalize(&case.task_type, &extraction.parsed_value);
        let round1 = self.normalize(&case.task_type, &r1.value);

        if automated != round1 {
            let created = self.repos.assignments.ensure_second_round(case.id, now).await?;
            trace!(case_id = %case.id, created, "Mismatch, routed to round 2");
            return Ok(FirstPass::SentToRound2);
        }

        let open_round2 = self
            .repos
            .assignments
            .active_case_ids(&[case.id], Round::Second)
            .await?;
        if !open_round2.is_empty()
            || self
                .repos
                .annotations
                .latest(case.id, Round::Second)
                .await?
                .is_some()
        {
            return Ok(FirstPass::AwaitingRound2);
        }

        if audit_rate > 0.0 && rng.gen::<f64>() < audit_rate {
            let created = self.repos.assignments.ensure_second_round(case.id, now).await?;
            debug!(
                subsystem = "workflow",
                component = "qc",
                case_id = %case.id,
                created,
                "Agreement sampled for audit"
            );
            return Ok(FirstPass::Audited);
        }

        let updated = self
            .repos
            .cases
            .finalize_if_unset(case.id, &round1, FinalizationSource::AutoConfirm, None, now)
            .await?;
        Ok(if updated == 1 {
            FirstPass::AutoConfirmed
        } else {
            FirstPass::AlreadyFinal
        })
    }

    fn normalize(&self, task_type: &str, raw: &str) -> String {
        self.normalizer
            .normalize(task_type, Some(raw))
            .unwrap_or_default()
    }

    // =========================================================================
    // ADJUDICATION
    // =========================================================================

    /// Manually set a case's gold label and close its open assignments.
    ///
    /// Declined when the adjudicator is unknown, the case or task type does
    /// not match, or the case already has a gold label.
    pub async fn adjudicate(
        &self,
        adjudicator_login: &str,
        req: &AdjudicationRequest,
    ) -> Result<AdjudicationResult> {
        self.adjudicate_at(adjudicator_login, req, Utc::now()).await
    }

    pub async fn adjudicate_at(
        &self,
        adjudicator_login: &str,
        req: &AdjudicationRequest,
        now: DateTime<Utc>,
    ) -> Result<AdjudicationResult> {
        let Some(adjudicator) = self
            .repos
            .reviewers
            .find_by_login(adjudicator_login.trim())
            .await?
        else {
            return Ok(declined("Adjudicator not found."));
        };

        let task_type = req.task_type.trim();
        let label = self.normalize(task_type, &req.final_label);
        let note = req.note.as_deref().map(str::trim).filter(|n| !n.is_empty());

        let updated = self
            .repos
            .cases
            .adjudicate(req.case_id, task_type, &label, adjudicator.id, note, now)
            .await?;

        if updated != 1 {
            let message = match self.repos.cases.get(req.case_id).await? {
                Some(case) if case.task_type.eq_ignore_ascii_case(task_type) => {
                    "Case already finalized."
                }
                _ => "Case not found or task type mismatch.",
            };
            return Ok(declined(message));
        }

        let closed = self
            .repos
            .assignments
            .close_open_for_case(req.case_id, now)
            .await?;

        info!(
            subsystem = "workflow",
            component = "qc",
            op = "adjudicate",
            case_id = %req.case_id,
            reviewer_id = %adjudicator.id,
            closed,
            "Adjudication saved"
        );

        Ok(AdjudicationResult {
            ok: true,
            message: "Adjudication saved.".to_string(),
        })
    }

    /// Cases waiting on adjudication with both human values and the latest
    /// automated output.
    pub async fn pending_adjudication(
        &self,
        task_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<PendingAdjudicationItem>> {
        let cases = self
            .repos
            .cases
            .list_pending_adjudication(task_type, limit)
            .await?;

        let mut items = Vec::with_capacity(cases.len());
        for case in cases {
            let r1 = self.repos.annotations.latest(case.id, Round::First).await?;
            let r2 = self.repos.annotations.latest(case.id, Round::Second).await?;
            let (Some(r1), Some(r2)) = (r1, r2) else {
                continue;
            };
            let automated_value = self.automated_value(case.id).await?;

            items.push(PendingAdjudicationItem {
                case_id: case.id,
                task_type: case.task_type,
                raw_text: case.raw_text,
                meta_info: case.meta_info,
                automated_value,
                round1_value: r1.value,
                round2_value: r2.value,
                round1_submitted_at: Some(r1.submitted_at),
                round2_submitted_at: Some(r2.submitted_at),
            });
        }
        Ok(items)
    }

    async fn automated_value(&self, case_id: Uuid) -> Result<Option<String>> {
        Ok(self
            .repos
            .extractions
            .latest(case_id)
            .await?
            .filter(|e| e.parsed_successfully)
            .map(|e| e.parsed_value))
    }
}

fn declined(message: &str) -> AdjudicationResult {
    AdjudicationResult {
        ok: false,
        message: message.to_string(),
    }
}
