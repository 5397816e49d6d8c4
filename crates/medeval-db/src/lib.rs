//! # medeval-db
//!
//! Relational store for medeval.
//!
//! This crate provides:
//! - Connection pool management
//! - The lease store (guarded transitions on `case_assignment` rows)
//! - Case, reviewer, annotation, extraction and evaluation repositories
//! - An in-memory store with the same conditional semantics, for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use medeval_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/medeval").await?;
//!     let repos = db.repositories();
//!     let reclaimed = repos.assignments.recycle_expired(chrono::Utc::now()).await?;
//!     println!("Reclaimed {} expired leases", reclaimed);
//!     Ok(())
//! }
//! ```

pub mod annotations;
pub mod assignments;
pub mod cases;
pub mod evaluation;
pub mod extractions;
pub mod memory;
pub mod pool;
pub mod reviewers;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

use std::sync::Arc;

// Re-export core types
pub use medeval_core::*;

pub use annotations::PgAnnotationRepository;
pub use assignments::PgAssignmentRepository;
pub use cases::PgCaseRepository;
pub use evaluation::PgEvaluationRepository;
pub use extractions::PgExtractionRepository;
pub use memory::InMemoryStore;
pub use pool::{create_pool_with_config, log_pool_metrics, PoolConfig};
pub use reviewers::PgReviewerRepository;

/// Database handle aggregating every PostgreSQL repository.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub reviewers: PgReviewerRepository,
    pub cases: PgCaseRepository,
    /// Lease store.
    pub assignments: PgAssignmentRepository,
    pub annotations: PgAnnotationRepository,
    pub extractions: PgExtractionRepository,
    pub evaluation: PgEvaluationRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            reviewers: PgReviewerRepository::new(pool.clone()),
            cases: PgCaseRepository::new(pool.clone()),
            assignments: PgAssignmentRepository::new(pool.clone()),
            annotations: PgAnnotationRepository::new(pool.clone()),
            extractions: PgExtractionRepository::new(pool.clone()),
            evaluation: PgEvaluationRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool_with_config(url, PoolConfig::default()).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Bundle the repositories as trait objects for the workflow layer.
    pub fn repositories(&self) -> Repositories {
        Repositories {
            reviewers: Arc::new(self.reviewers.clone()),
            cases: Arc::new(self.cases.clone()),
            assignments: Arc::new(self.assignments.clone()),
            annotations: Arc::new(self.annotations.clone()),
            extractions: Arc::new(self.extractions.clone()),
            evaluation: Arc::new(self.evaluation.clone()),
        }
    }
}
