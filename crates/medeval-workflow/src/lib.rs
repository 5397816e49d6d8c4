//! # medeval-workflow
//!
//! Annotation workflow services for medeval.
//!
//! This crate provides:
//! - The assignment arbiter (acquire, heartbeat, submit, skip)
//! - Seeding of Ready assignments and expired-lease recycling
//! - The QC convergence pipeline and manual adjudication
//! - The evaluation report builder
//! - A background maintenance worker
//!
//! Every service runs against [`medeval_core::Repositories`], so the same code
//! drives the PostgreSQL store and the in-memory store.
//!
//! ## Example
//!
//! ```ignore
//! use medeval_db::Database;
//! use medeval_workflow::{AssignmentArbiter, WorkflowConfig};
//!
//! let config = WorkflowConfig::from_env();
//! let db = Database::connect(&config.database_url).await?;
//! let arbiter = AssignmentArbiter::from_config(db.repositories(), &config);
//!
//! if let Some(work) = arbiter.acquire("reviewer-1").await? {
//!     println!("{} (round {})", work.case_id, work.round);
//! }
//! ```

pub mod arbiter;
pub mod config;
pub mod qc;
pub mod report;
pub mod seeding;
pub mod worker;

// Re-export core types
pub use medeval_core::*;

pub use arbiter::AssignmentArbiter;
pub use config::WorkflowConfig;
pub use qc::QcPipeline;
pub use report::{EvaluationReport, EvaluationReporter};
pub use seeding::Seeder;
pub use worker::{MaintenanceWorker, WorkerConfig, WorkerEvent, WorkerHandle};
