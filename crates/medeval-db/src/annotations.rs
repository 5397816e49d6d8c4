//! Annotation read repository. Writes go through the lease store's submit.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use medeval_core::{Annotation, AnnotationRepository, Error, Result, Round};

const ANNOTATION_COLUMNS: &str = "id, case_id, task_type, value, uncertainty, reviewer_id, round, \
     started_at, submitted_at, created_at, difficulty_score, confidence_score";

/// PostgreSQL implementation of AnnotationRepository.
#[derive(Clone)]
pub struct PgAnnotationRepository {
    pool: Pool<Postgres>,
}

impl PgAnnotationRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: &PgRow) -> Result<Annotation> {
        let round: i16 = row.try_get("round")?;
        Ok(Annotation {
            id: row.try_get("id")?,
            case_id: row.try_get("case_id")?,
            task_type: row.try_get("task_type")?,
            value: row.try_get("value")?,
            uncertainty: row.try_get("uncertainty")?,
            reviewer_id: row.try_get("reviewer_id")?,
            round: Round::try_from(round)?,
            started_at: row.try_get("started_at")?,
            submitted_at: row.try_get("submitted_at")?,
            created_at: row.try_get("created_at")?,
            difficulty_score: row.try_get("difficulty_score")?,
            confidence_score: row.try_get("confidence_score")?,
        })
    }
}

#[async_trait]
impl AnnotationRepository for PgAnnotationRepository {
    async fn latest(&self, case_id: Uuid, round: Round) -> Result<Option<Annotation>> {
        let row = sqlx::query(&format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotation
             WHERE case_id = $1 AND round = $2
             ORDER BY submitted_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(case_id)
        .bind(round.as_i16())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list_for_case(&self, case_id: Uuid) -> Result<Vec<Annotation>> {
        let rows = sqlx::query(&format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotation
             WHERE case_id = $1
             ORDER BY round, submitted_at, id"
        ))
        .bind(case_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_row).collect()
    }
}
