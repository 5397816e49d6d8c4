//! # medeval-core
//!
//! Core types, traits and pure algorithms for the medeval annotation workflow.
//!
//! This crate has no I/O. The store lives in `medeval-db`; the reviewer
//! protocol, QC pipeline and reporting live in `medeval-workflow`.

pub mod defaults;
pub mod error;
pub mod models;
pub mod normalize;
pub mod stats;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use normalize::{looks_like_refusal, LabelNormalizer, NOT_MENTIONED};
pub use stats::{
    AccuracyEstimate, AgreementSummary, Evaluation, EvaluationConfig, EvaluationRow, FlowCounts,
    McNemarOutcome, McNemarResult, TaskEvaluation,
};
pub use traits::*;
pub use uuid_utils::new_v7;
