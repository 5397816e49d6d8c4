//! Automated extraction repository.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use medeval_core::{
    new_v7, AutomatedExtraction, Error, ExtractionRepository, NewExtraction, Result,
};

const EXTRACTION_COLUMNS: &str =
    "id, case_id, parsed_value, parsed_successfully, raw_response, error_code, created_at";

/// PostgreSQL implementation of ExtractionRepository.
#[derive(Clone)]
pub struct PgExtractionRepository {
    pool: Pool<Postgres>,
}

impl PgExtractionRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: &PgRow) -> Result<AutomatedExtraction> {
        Ok(AutomatedExtraction {
            id: row.try_get("id")?,
            case_id: row.try_get("case_id")?,
            parsed_value: row.try_get("parsed_value")?,
            parsed_successfully: row.try_get("parsed_successfully")?,
            raw_response: row.try_get("raw_response")?,
            error_code: row.try_get("error_code")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ExtractionRepository for PgExtractionRepository {
    async fn insert(&self, req: NewExtraction) -> Result<AutomatedExtraction> {
        let row = sqlx::query(&format!(
            "INSERT INTO model_extraction
                 (id, case_id, parsed_value, parsed_successfully, raw_response, error_code,
                  created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {EXTRACTION_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(req.case_id)
        .bind(&req.parsed_value)
        .bind(req.parsed_successfully)
        .bind(&req.raw_response)
        .bind(&req.error_code)
        .bind(req.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_row(&row)
    }

    async fn latest(&self, case_id: Uuid) -> Result<Option<AutomatedExtraction>> {
        let row = sqlx::query(&format!(
            "SELECT {EXTRACTION_COLUMNS} FROM model_extraction
             WHERE case_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_row).transpose()
    }
}
