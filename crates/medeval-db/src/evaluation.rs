//! Bulk evaluation read: one row per case with its latest extraction and the
//! latest annotation of each round.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use medeval_core::{Error, EvaluationRepository, EvaluationSourceRow, Result};

/// PostgreSQL implementation of EvaluationRepository.
#[derive(Clone)]
pub struct PgEvaluationRepository {
    pool: Pool<Postgres>,
}

impl PgEvaluationRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EvaluationRepository for PgEvaluationRepository {
    async fn load_rows(&self, task_types: &[String]) -> Result<Vec<EvaluationSourceRow>> {
        let filter: Vec<String> = task_types
            .iter()
            .map(|t| t.trim().to_ascii_uppercase())
            .collect();

        let rows = sqlx::query(
            "SELECT c.id AS case_id,
                    c.task_type,
                    c.final_gold_label AS gold,
                    m.parsed_value AS automated,
                    COALESCE(m.parsed_successfully, FALSE) AS automated_parsed_ok,
                    r1.value AS round1,
                    r2.value AS round2
             FROM case_item c
             LEFT JOIN LATERAL (
                 SELECT parsed_value, parsed_successfully FROM model_extraction
                 WHERE case_id = c.id
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1
             ) m ON TRUE
             LEFT JOIN LATERAL (
                 SELECT value FROM annotation
                 WHERE case_id = c.id AND round = 1
                 ORDER BY submitted_at DESC, id DESC
                 LIMIT 1
             ) r1 ON TRUE
             LEFT JOIN LATERAL (
                 SELECT value FROM annotation
                 WHERE case_id = c.id AND round = 2
                 ORDER BY submitted_at DESC, id DESC
                 LIMIT 1
             ) r2 ON TRUE
             WHERE cardinality($1::text[]) = 0 OR upper(c.task_type) = ANY($1)
             ORDER BY c.id",
        )
        .bind(&filter)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter()
            .map(|row| -> Result<EvaluationSourceRow> {
                Ok(EvaluationSourceRow {
                    case_id: row.try_get("case_id")?,
                    task_type: row.try_get("task_type")?,
                    automated: row.try_get("automated")?,
                    automated_parsed_ok: row.try_get("automated_parsed_ok")?,
                    round1: row.try_get("round1")?,
                    round2: row.try_get("round2")?,
                    gold: row.try_get("gold")?,
                })
            })
            .collect()
    }
}
