//! Reviewer repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};

use medeval_core::{new_v7, Error, Result, Reviewer, ReviewerRepository};

const REVIEWER_COLUMNS: &str = "id, login_name, display_name, is_admin, created_at";

/// PostgreSQL implementation of ReviewerRepository.
#[derive(Clone)]
pub struct PgReviewerRepository {
    pool: Pool<Postgres>,
}

impl PgReviewerRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: &PgRow) -> Result<Reviewer> {
        Ok(Reviewer {
            id: row.try_get("id")?,
            login_name: row.try_get("login_name")?,
            display_name: row.try_get("display_name")?,
            is_admin: row.try_get("is_admin")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ReviewerRepository for PgReviewerRepository {
    async fn ensure(&self, login_name: &str) -> Result<Reviewer> {
        let login = login_name.trim();
        if login.is_empty() {
            return Err(Error::InvalidInput("login name is empty".to_string()));
        }

        // The no-op DO UPDATE makes RETURNING yield the existing row on conflict.
        let row = sqlx::query(&format!(
            "INSERT INTO reviewer (id, login_name, display_name, is_admin, created_at)
             VALUES ($1, $2, $2, FALSE, $3)
             ON CONFLICT (login_name) DO UPDATE SET login_name = EXCLUDED.login_name
             RETURNING {REVIEWER_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(login)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_row(&row)
    }

    async fn find_by_login(&self, login_name: &str) -> Result<Option<Reviewer>> {
        let row = sqlx::query(&format!(
            "SELECT {REVIEWER_COLUMNS} FROM reviewer WHERE login_name = $1"
        ))
        .bind(login_name.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_row).transpose()
    }
}
