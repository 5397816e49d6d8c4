//! Case repository implementation.
//!
//! Every gold-label write is guarded by `final_gold_label IS NULL`, so the
//! label is set at most once no matter how many QC runs or adjudicators race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use medeval_core::{
    new_v7, Case, CaseRef, CaseRepository, Error, FinalizationSource, NewCase, Result, Round,
};

const CASE_COLUMNS: &str = "id, task_type, raw_text, meta_info, status::text AS status, \
     final_gold_label, finalized_by, finalization_source::text AS finalization_source, \
     finalized_at, adjudication_note, created_at";

/// PostgreSQL implementation of CaseRepository.
#[derive(Clone)]
pub struct PgCaseRepository {
    pool: Pool<Postgres>,
}

impl PgCaseRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub(crate) fn parse_row(row: &PgRow) -> Result<Case> {
        let status: String = row.try_get("status")?;
        let source: Option<String> = row.try_get("finalization_source")?;
        Ok(Case {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            raw_text: row.try_get("raw_text")?,
            meta_info: row.try_get("meta_info")?,
            status: status.parse()?,
            final_gold_label: row.try_get("final_gold_label")?,
            finalized_by: row.try_get("finalized_by")?,
            finalization_source: source.map(|s| s.parse()).transpose()?,
            finalized_at: row.try_get("finalized_at")?,
            adjudication_note: row.try_get("adjudication_note")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn limit_param(limit: Option<usize>) -> Option<i64> {
    limit.map(|l| l.min(i64::MAX as usize) as i64)
}

#[async_trait]
impl CaseRepository for PgCaseRepository {
    async fn insert(&self, req: NewCase) -> Result<Case> {
        let row = sqlx::query(&format!(
            "INSERT INTO case_item (id, task_type, raw_text, meta_info, status, created_at)
             VALUES ($1, $2, $3, $4, 'open'::case_status, $5)
             RETURNING {CASE_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(&req.task_type)
        .bind(&req.raw_text)
        .bind(&req.meta_info)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Case>> {
        let row = sqlx::query(&format!("SELECT {CASE_COLUMNS} FROM case_item WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list_unfinalized(
        &self,
        task_types: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<CaseRef>> {
        // LIMIT NULL means no limit.
        let rows = sqlx::query(
            "SELECT id, task_type FROM case_item
             WHERE final_gold_label IS NULL
               AND (cardinality($1::text[]) = 0 OR task_type = ANY($1))
             ORDER BY id
             LIMIT $2",
        )
        .bind(task_types)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter()
            .map(|row| -> Result<CaseRef> {
                Ok(CaseRef {
                    id: row.try_get("id")?,
                    task_type: row.try_get("task_type")?,
                })
            })
            .collect()
    }

    async fn seed_candidates(
        &self,
        task_type: &str,
        round: Round,
        exclude_seeded: bool,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT c.id FROM case_item c
             WHERE c.task_type = $1
               AND c.final_gold_label IS NULL
               AND (NOT $3 OR NOT EXISTS (
                   SELECT 1 FROM case_assignment a WHERE a.case_id = c.id AND a.round = $2
               ))
             ORDER BY c.id
             LIMIT $4",
        )
        .bind(task_type)
        .bind(round.as_i16())
        .bind(exclude_seeded)
        .bind(limit_param(Some(limit)))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn finalize_if_unset(
        &self,
        case_id: Uuid,
        label: &str,
        source: FinalizationSource,
        finalized_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE case_item
             SET final_gold_label = $2,
                 finalization_source = $3::finalization_source,
                 finalized_by = $4,
                 finalized_at = $5,
                 status = 'finalized'::case_status
             WHERE id = $1 AND final_gold_label IS NULL",
        )
        .bind(case_id)
        .bind(label)
        .bind(source.as_str())
        .bind(finalized_by)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn mark_needs_adjudication(&self, case_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE case_item
             SET status = 'needs_adjudication'::case_status
             WHERE id = $1 AND final_gold_label IS NULL",
        )
        .bind(case_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
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
        let result = sqlx::query(
            "UPDATE case_item
             SET final_gold_label = $3,
                 finalization_source = 'adjudication'::finalization_source,
                 finalized_by = $4,
                 adjudication_note = $5,
                 finalized_at = $6,
                 status = 'finalized'::case_status
             WHERE id = $1
               AND upper(task_type) = upper($2)
               AND final_gold_label IS NULL",
        )
        .bind(case_id)
        .bind(task_type.trim())
        .bind(label)
        .bind(adjudicator_id)
        .bind(note)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn list_pending_adjudication(
        &self,
        task_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Case>> {
        let rows = sqlx::query(&format!(
            "SELECT {CASE_COLUMNS} FROM case_item
             WHERE status = 'needs_adjudication'::case_status
               AND final_gold_label IS NULL
               AND ($1::text IS NULL OR upper(task_type) = upper($1))
             ORDER BY id
             LIMIT $2"
        ))
        .bind(task_type)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_row).collect()
    }
}
