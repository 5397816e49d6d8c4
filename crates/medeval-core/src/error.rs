//! Error types for medeval.

use thiserror::Error;

/// Result type alias using medeval's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for medeval operations.
///
/// Expected contention (a conditional update that matched no row) is never
/// reported through this type; store operations return affected-row counts
/// and workflow operations return typed outcomes for that.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a uniqueness-constraint rejection.
    ///
    /// Recognises both the mapped [`Error::UniqueViolation`] and raw driver
    /// errors that slipped through unmapped.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::UniqueViolation(_) => true,
            Error::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }

    /// Map a driver error, turning unique violations into [`Error::UniqueViolation`].
    pub fn from_write(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                Error::UniqueViolation(constraint)
            }
            other => Error::Database(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
