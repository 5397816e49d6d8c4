//! Seeding of claimable work and reclaiming of expired leases.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use medeval_core::defaults::SEED_CONFLICT_RETRIES;
use medeval_core::{
    Error, Repositories, Result, Round, SeedAssignmentsRequest, SeedAssignmentsResult,
    SeedPerTaskTypeResult,
};

/// Pre-populates Ready assignments and sweeps expired leases.
#[derive(Clone)]
pub struct Seeder {
    repos: Repositories,
}

impl Seeder {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    /// Create up to `per_task_type_count` Ready rows for each task type.
    ///
    /// Candidates are taken in id order. A uniqueness conflict from a
    /// concurrent seeding run is resolved by recomputing which candidates
    /// still lack an active row and inserting only those.
    pub async fn seed(&self, req: &SeedAssignmentsRequest) -> Result<SeedAssignmentsResult> {
        self.seed_at(req, Utc::now()).await
    }

    pub async fn seed_at(
        &self,
        req: &SeedAssignmentsRequest,
        now: DateTime<Utc>,
    ) -> Result<SeedAssignmentsResult> {
        let per = req.per_task_type_count;
        let task_types: Vec<&str> = req
            .task_types
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();

        let mut result = SeedAssignmentsResult {
            requested_total: per.saturating_mul(task_types.len()),
            ..Default::default()
        };
        if per == 0 || task_types.is_empty() {
            return Ok(result);
        }

        for task_type in task_types {
            let candidates = self
                .repos
                .cases
                .seed_candidates(task_type, req.round, req.exclude_already_seeded, per)
                .await?;
            let created = self.insert_with_retry(&candidates, req.round, now).await?;

            info!(
                subsystem = "workflow",
                component = "seeder",
                op = "seed",
                task_type,
                round = req.round.as_i16(),
                candidates = candidates.len(),
                created,
                "Seeded task type"
            );

            result.created_total += created;
            result.per_task_type.push(SeedPerTaskTypeResult {
                task_type: task_type.to_string(),
                requested: per,
                created,
            });
        }

        Ok(result)
    }

    async fn insert_with_retry(
        &self,
        candidates: &[Uuid],
        round: Round,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut pending: Vec<Uuid> = candidates.to_vec();
        let mut created = 0usize;

        for attempt in 0..=SEED_CONFLICT_RETRIES {
            if pending.is_empty() {
                break;
            }
            match self.repos.assignments.insert_ready(&pending, round, now).await {
                Ok(n) => {
                    created += n as usize;
                    break;
                }
                Err(Error::UniqueViolation(detail)) => {
                    let active: HashSet<Uuid> = self
                        .repos
                        .assignments
                        .active_case_ids(&pending, round)
                        .await?
                        .into_iter()
                        .collect();
                    pending.retain(|id| !active.contains(id));
                    warn!(
                        subsystem = "workflow",
                        component = "seeder",
                        op = "seed",
                        attempt,
                        remaining = pending.len(),
                        %detail,
                        "Seeding conflict, retrying missing subset"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(created)
    }

    /// Return every expired lease to Ready in one bulk write.
    pub async fn recycle_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let recycled = self.repos.assignments.recycle_expired(now).await?;
        if recycled > 0 {
            info!(
                subsystem = "workflow",
                component = "seeder",
                op = "recycle",
                recycled,
                "Reclaimed expired leases"
            );
        }
        Ok(recycled)
    }
}
