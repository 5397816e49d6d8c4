//! Centralized default constants for medeval.
//!
//! Every crate references these instead of defining its own magic numbers.

// =============================================================================
// LEASES
// =============================================================================

/// Lease length granted on claim, renewal and heartbeat.
pub const LEASE_DURATION_MINUTES: i64 = 20;

/// Upper bound on claim attempts within one acquire call.
///
/// Each lost race excludes the contested candidate and retries with the next
/// one; the bound keeps a pathological storm from spinning forever.
pub const MAX_CLAIM_ATTEMPTS: usize = 16;

// =============================================================================
// SEEDING
// =============================================================================

/// Retries of the missing subset after a uniqueness conflict while seeding.
pub const SEED_CONFLICT_RETRIES: usize = 3;

// =============================================================================
// QUALITY CONTROL
// =============================================================================

/// Probability that an automated/round-1 agreement is routed to round 2.
pub const QC_AUDIT_RATE: f64 = 0.1;

// =============================================================================
// EVALUATION
// =============================================================================

/// Confidence level for Wilson score intervals.
pub const EVAL_CONFIDENCE: f64 = 0.95;

/// Minimum number of fully paired cases before McNemar's test is attempted.
pub const MCNEMAR_MIN_PAIRS: usize = 10;

// =============================================================================
// LABELS
// =============================================================================

/// Task-type markers that make a task boolean-like (case-insensitive substring).
pub const BOOLEAN_TASK_MARKERS: &[&str] = &["CTA"];

// =============================================================================
// WORKER
// =============================================================================

/// Interval between expired-lease sweeps in the maintenance worker.
pub const SWEEP_INTERVAL_MS: u64 = 60_000;

/// Run QC every N sweeps; `0` disables QC in the maintenance worker.
pub const QC_EVERY_N_SWEEPS: u32 = 0;

/// Capacity of the maintenance worker's event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_policy() {
        assert_eq!(LEASE_DURATION_MINUTES, 20);
        assert!(MAX_CLAIM_ATTEMPTS > 1);
    }

    #[test]
    fn test_audit_rate_is_probability() {
        assert!((0.0..=1.0).contains(&QC_AUDIT_RATE));
    }

    #[test]
    fn test_eval_confidence_is_open_interval() {
        assert!(EVAL_CONFIDENCE > 0.0 && EVAL_CONFIDENCE < 1.0);
    }
}
