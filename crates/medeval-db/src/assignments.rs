//! Assignment repository: the PostgreSQL lease store.
//!
//! Each transition is one guarded `UPDATE` carrying both the row identity and
//! the expected pre-state. Callers branch on `rows_affected()`; zero means the
//! row moved on (lost race, expired, wrong holder).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use medeval_core::{
    new_v7, Annotation, Assignment, AssignmentRepository, Error, LeaseGuard, Result, Round,
    SubmitWrite,
};

const ASSIGNMENT_COLUMNS: &str = "a.id, a.case_id, a.round, a.status::text AS status, \
     a.reviewer_id, a.annotation_id, a.assigned_at, a.expires_at, a.last_seen_at, \
     a.completed_at, a.attempt, a.skip_reason, a.created_at";

/// PostgreSQL implementation of AssignmentRepository.
#[derive(Clone)]
pub struct PgAssignmentRepository {
    pool: Pool<Postgres>,
}

impl PgAssignmentRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: &PgRow) -> Result<Assignment> {
        let status: String = row.try_get("status")?;
        let round: i16 = row.try_get("round")?;
        Ok(Assignment {
            id: row.try_get("id")?,
            case_id: row.try_get("case_id")?,
            round: Round::try_from(round)?,
            status: status.parse()?,
            reviewer_id: row.try_get("reviewer_id")?,
            annotation_id: row.try_get("annotation_id")?,
            assigned_at: row.try_get("assigned_at")?,
            expires_at: row.try_get("expires_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            completed_at: row.try_get("completed_at")?,
            attempt: row.try_get("attempt")?,
            skip_reason: row.try_get("skip_reason")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl AssignmentRepository for PgAssignmentRepository {
    async fn get(&self, id: Uuid) -> Result<Option<Assignment>> {
        let row = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM case_assignment a WHERE a.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_live_for_reviewer(
        &self,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        let row = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM case_assignment a
             WHERE a.reviewer_id = $1
               AND a.status = 'assigned'::assignment_status
               AND a.expires_at > $2
             ORDER BY a.assigned_at, a.id
             LIMIT 1"
        ))
        .bind(reviewer_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn next_candidate(
        &self,
        reviewer_id: Uuid,
        round: Round,
        excluded: &[Uuid],
    ) -> Result<Option<Assignment>> {
        // Round 2 needs a round-1 judgment by someone else and no round-2
        // judgment yet; round 1 needs no round-1 judgment at all.
        let round_clause = match round {
            Round::First => {
                "NOT EXISTS (
                     SELECT 1 FROM annotation x WHERE x.case_id = a.case_id AND x.round = 1
                 )"
            }
            Round::Second => {
                "EXISTS (SELECT 1 FROM annotation x WHERE x.case_id = a.case_id AND x.round = 1)
                 AND NOT EXISTS (
                     SELECT 1 FROM annotation x WHERE x.case_id = a.case_id AND x.round = 2
                 )
                 AND NOT EXISTS (
                     SELECT 1 FROM annotation x
                     WHERE x.case_id = a.case_id AND x.round = 1 AND x.reviewer_id = $1
                 )"
            }
        };

        let query = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM case_assignment a
             JOIN case_item c ON c.id = a.case_id
             WHERE a.round = $2
               AND a.status = 'ready'::assignment_status
               AND a.reviewer_id IS NULL
               AND c.final_gold_label IS NULL
               AND NOT (a.id = ANY($3::uuid[]))
               AND NOT EXISTS (
                   SELECT 1 FROM annotation x
                   WHERE x.case_id = a.case_id AND x.round = a.round AND x.reviewer_id = $1
               )
               AND {round_clause}
             ORDER BY a.attempt ASC, a.id ASC
             LIMIT 1"
        );

        let row = sqlx::query(&query)
            .bind(reviewer_id)
            .bind(round.as_i16())
            .bind(excluded)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn claim(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE case_assignment
             SET status = 'assigned'::assignment_status,
                 reviewer_id = $2,
                 assigned_at = $3,
                 last_seen_at = $3,
                 expires_at = $4
             WHERE id = $1
               AND status = 'ready'::assignment_status
               AND reviewer_id IS NULL
               AND EXISTS (
                   SELECT 1 FROM case_item c
                   WHERE c.id = case_assignment.case_id AND c.final_gold_label IS NULL
               )",
        )
        .bind(id)
        .bind(reviewer_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn renew(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE case_assignment
             SET expires_at = $4, last_seen_at = $3
             WHERE id = $1
               AND reviewer_id = $2
               AND status = 'assigned'::assignment_status
               AND expires_at > $3",
        )
        .bind(id)
        .bind(reviewer_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn release_expired(&self, id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE case_assignment
             SET status = 'ready'::assignment_status,
                 reviewer_id = NULL,
                 assigned_at = NULL,
                 expires_at = NULL,
                 last_seen_at = NULL,
                 annotation_id = NULL,
                 attempt = attempt + 1
             WHERE id = $1
               AND status = 'assigned'::assignment_status
               AND expires_at <= $2",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn recycle_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE case_assignment
             SET status = 'ready'::assignment_status,
                 reviewer_id = NULL,
                 assigned_at = NULL,
                 expires_at = NULL,
                 last_seen_at = NULL,
                 annotation_id = NULL,
                 attempt = attempt + 1
             WHERE status = 'assigned'::assignment_status
               AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn submit(
        &self,
        guard: &LeaseGuard,
        annotation: &Annotation,
        now: DateTime<Utc>,
    ) -> Result<SubmitWrite> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let inserted = sqlx::query(
            "INSERT INTO annotation (id, case_id, task_type, value, uncertainty, reviewer_id, round,
                                     started_at, submitted_at, created_at,
                                     difficulty_score, confidence_score)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (case_id, reviewer_id, round) DO NOTHING",
        )
        .bind(annotation.id)
        .bind(annotation.case_id)
        .bind(&annotation.task_type)
        .bind(&annotation.value)
        .bind(&annotation.uncertainty)
        .bind(annotation.reviewer_id)
        .bind(annotation.round.as_i16())
        .bind(annotation.started_at)
        .bind(annotation.submitted_at)
        .bind(annotation.created_at)
        .bind(annotation.difficulty_score)
        .bind(annotation.confidence_score)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(SubmitWrite::DuplicateAnnotation);
        }

        let updated = sqlx::query(
            "UPDATE case_assignment
             SET status = 'submitted'::assignment_status,
                 completed_at = $4,
                 last_seen_at = $4,
                 expires_at = NULL,
                 annotation_id = $5
             WHERE id = $1
               AND case_id = $2
               AND reviewer_id = $3
               AND status = 'assigned'::assignment_status
               AND expires_at > $4",
        )
        .bind(guard.assignment_id)
        .bind(guard.case_id)
        .bind(guard.reviewer_id)
        .bind(now)
        .bind(annotation.id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if updated.rows_affected() == 0 {
            debug!(
                subsystem = "db",
                component = "assignments",
                op = "submit",
                assignment_id = %guard.assignment_id,
                "Lease lost during submit, rolling back annotation"
            );
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(SubmitWrite::LeaseLost);
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(SubmitWrite::Committed)
    }

    async fn skip(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE case_assignment
             SET status = 'skipped'::assignment_status,
                 completed_at = $4,
                 last_seen_at = $4,
                 expires_at = NULL,
                 skip_reason = $3
             WHERE id = $1
               AND reviewer_id = $2
               AND status = 'assigned'::assignment_status
               AND expires_at > $4",
        )
        .bind(id)
        .bind(reviewer_id)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn insert_ready(
        &self,
        case_ids: &[Uuid],
        round: Round,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        if case_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = case_ids.iter().map(|_| new_v7()).collect();

        // Single statement: a conflict on any row rejects the whole batch.
        let result = sqlx::query(
            "INSERT INTO case_assignment (id, case_id, round, status, attempt, created_at)
             SELECT t.id, t.case_id, $3, 'ready'::assignment_status, 0, $4
             FROM UNNEST($1::uuid[], $2::uuid[]) AS t(id, case_id)",
        )
        .bind(&ids)
        .bind(case_ids)
        .bind(round.as_i16())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::from_write)?;

        Ok(result.rows_affected())
    }

    async fn active_case_ids(&self, case_ids: &[Uuid], round: Round) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT case_id FROM case_assignment
             WHERE case_id = ANY($1::uuid[])
               AND round = $2
               AND status IN ('ready'::assignment_status, 'assigned'::assignment_status)",
        )
        .bind(case_ids)
        .bind(round.as_i16())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn ensure_second_round(&self, case_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "INSERT INTO case_assignment (id, case_id, round, status, attempt, created_at)
             SELECT $1, $2, 2, 'ready'::assignment_status, 0, $3
             WHERE EXISTS (
                     SELECT 1 FROM case_item c WHERE c.id = $2 AND c.final_gold_label IS NULL
                 )
               AND NOT EXISTS (
                     SELECT 1 FROM annotation x WHERE x.case_id = $2 AND x.round = 2
                 )
               AND NOT EXISTS (
                     SELECT 1 FROM case_assignment a
                     WHERE a.case_id = $2 AND a.round = 2
                       AND a.status IN ('ready'::assignment_status, 'assigned'::assignment_status)
                 )
             ON CONFLICT (case_id, round) WHERE status IN ('ready', 'assigned') DO NOTHING",
        )
        .bind(new_v7())
        .bind(case_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn close_open_for_case(&self, case_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE case_assignment
             SET status = 'skipped'::assignment_status,
                 completed_at = $2,
                 reviewer_id = NULL,
                 assigned_at = NULL,
                 expires_at = NULL,
                 last_seen_at = NULL,
                 skip_reason = COALESCE(skip_reason, 'closed by adjudication')
             WHERE case_id = $1
               AND status IN ('ready'::assignment_status, 'assigned'::assignment_status)",
        )
        .bind(case_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn list_for_case(&self, case_id: Uuid) -> Result<Vec<Assignment>> {
        let rows = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM case_assignment a
             WHERE a.case_id = $1
             ORDER BY a.round, a.created_at, a.id"
        ))
        .bind(case_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_row).collect()
    }
}
