//! Environment-driven configuration for the workflow services and worker.

use chrono::Duration;

use medeval_core::defaults;
use medeval_core::{EvaluationConfig, LabelNormalizer, QcProgressRequest};

/// Settings shared by the arbiter, QC pipeline, report and maintenance worker.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub database_url: String,
    pub lease_duration_minutes: i64,
    /// Open a round-2 row when a round-1 submission disagrees with the
    /// latest automated extraction, without waiting for the next QC scan.
    pub escalate_on_submit: bool,
    pub qc_audit_rate: f64,
    pub qc_create_audit_assignments: bool,
    pub qc_rng_seed: Option<u64>,
    pub sweep_interval_ms: u64,
    pub qc_every_n_sweeps: u32,
    pub worker_enabled: bool,
    pub boolean_task_markers: Vec<String>,
    pub eval_confidence: f64,
    pub eval_mcnemar_min_pairs: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/medeval".to_string(),
            lease_duration_minutes: defaults::LEASE_DURATION_MINUTES,
            escalate_on_submit: false,
            qc_audit_rate: defaults::QC_AUDIT_RATE,
            qc_create_audit_assignments: true,
            qc_rng_seed: None,
            sweep_interval_ms: defaults::SWEEP_INTERVAL_MS,
            qc_every_n_sweeps: defaults::QC_EVERY_N_SWEEPS,
            worker_enabled: true,
            boolean_task_markers: defaults::BOOLEAN_TASK_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            eval_confidence: defaults::EVAL_CONFIDENCE,
            eval_mcnemar_min_pairs: defaults::MCNEMAR_MIN_PAIRS,
        }
    }
}

impl WorkflowConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DATABASE_URL` | `postgres://localhost/medeval` | Store connection |
    /// | `LEASE_DURATION_MINUTES` | `20` | Lease length |
    /// | `ARBITER_ESCALATE_ON_SUBMIT` | `false` | Open round 2 on mismatch at submit |
    /// | `QC_AUDIT_RATE` | `0.1` | Audit probability, clamped to [0, 1] |
    /// | `QC_CREATE_AUDIT_ASSIGNMENTS` | `true` | Audit sampling on/off |
    /// | `QC_RNG_SEED` | unset | Deterministic audit sampling |
    /// | `SWEEP_INTERVAL_MS` | `60000` | Maintenance worker period |
    /// | `QC_EVERY_N_SWEEPS` | `0` | Run QC every N sweeps (0 = never) |
    /// | `WORKER_ENABLED` | `true` | Start the maintenance loop |
    /// | `BOOLEAN_TASK_MARKERS` | `CTA` | Comma list of boolean-like task markers |
    /// | `EVAL_CONFIDENCE` | `0.95` | Wilson interval confidence |
    /// | `EVAL_MCNEMAR_MIN_PAIRS` | `10` | Minimum paired sample for McNemar |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse from an arbitrary key lookup. Unparseable values fall back to
    /// their defaults.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();

        let flag = |key: &str, default: bool| {
            get(key)
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default)
        };

        let lease_duration_minutes = get("LEASE_DURATION_MINUTES")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|m| *m > 0)
            .unwrap_or(base.lease_duration_minutes);

        let qc_audit_rate = get("QC_AUDIT_RATE")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|r| r.is_finite())
            .unwrap_or(base.qc_audit_rate)
            .clamp(0.0, 1.0);

        let qc_rng_seed = get("QC_RNG_SEED").and_then(|v| v.parse::<u64>().ok());

        let sweep_interval_ms = get("SWEEP_INTERVAL_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(base.sweep_interval_ms)
            .max(1);

        let qc_every_n_sweeps = get("QC_EVERY_N_SWEEPS")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(base.qc_every_n_sweeps);

        let boolean_task_markers = get("BOOLEAN_TASK_MARKERS")
            .map(|v| {
                v.split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or(base.boolean_task_markers);

        let eval_confidence = get("EVAL_CONFIDENCE")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|c| *c > 0.0 && *c < 1.0)
            .unwrap_or(base.eval_confidence);

        let eval_mcnemar_min_pairs = get("EVAL_MCNEMAR_MIN_PAIRS")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(base.eval_mcnemar_min_pairs);

        Self {
            database_url: get("DATABASE_URL").unwrap_or(base.database_url),
            lease_duration_minutes,
            escalate_on_submit: flag("ARBITER_ESCALATE_ON_SUBMIT", base.escalate_on_submit),
            qc_audit_rate,
            qc_create_audit_assignments: flag(
                "QC_CREATE_AUDIT_ASSIGNMENTS",
                base.qc_create_audit_assignments,
            ),
            qc_rng_seed,
            sweep_interval_ms,
            qc_every_n_sweeps,
            worker_enabled: flag("WORKER_ENABLED", base.worker_enabled),
            boolean_task_markers,
            eval_confidence,
            eval_mcnemar_min_pairs,
        }
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::minutes(self.lease_duration_minutes)
    }

    pub fn normalizer(&self) -> LabelNormalizer {
        LabelNormalizer::new(self.boolean_task_markers.iter().cloned())
    }

    pub fn evaluation(&self) -> EvaluationConfig {
        EvaluationConfig {
            confidence: self.eval_confidence,
            mcnemar_min_pairs: self.eval_mcnemar_min_pairs,
        }
    }

    /// QC request covering every task type with the configured sampling.
    pub fn qc_request(&self) -> QcProgressRequest {
        QcProgressRequest {
            task_types: Vec::new(),
            max_cases: None,
            audit_rate: self.qc_audit_rate,
            create_audit_assignments: self.qc_create_audit_assignments,
            rng_seed: self.qc_rng_seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = WorkflowConfig::from_lookup(lookup(&[]));
        assert_eq!(config.lease_duration_minutes, 20);
        assert_eq!(config.qc_audit_rate, 0.1);
        assert!(config.qc_create_audit_assignments);
        assert_eq!(config.qc_rng_seed, None);
        assert_eq!(config.qc_every_n_sweeps, 0);
        assert!(config.worker_enabled);
        assert!(!config.escalate_on_submit);
        assert_eq!(config.boolean_task_markers, vec!["CTA".to_string()]);
    }

    #[test]
    fn test_audit_rate_is_clamped() {
        let high = WorkflowConfig::from_lookup(lookup(&[("QC_AUDIT_RATE", "3.5")]));
        assert_eq!(high.qc_audit_rate, 1.0);
        let low = WorkflowConfig::from_lookup(lookup(&[("QC_AUDIT_RATE", "-1")]));
        assert_eq!(low.qc_audit_rate, 0.0);
        let junk = WorkflowConfig::from_lookup(lookup(&[("QC_AUDIT_RATE", "NaN")]));
        assert_eq!(junk.qc_audit_rate, 0.1);
    }

    #[test]
    fn test_flags_and_numbers() {
        let config = WorkflowConfig::from_lookup(lookup(&[
            ("WORKER_ENABLED", "0"),
            ("QC_CREATE_AUDIT_ASSIGNMENTS", "false"),
            ("ARBITER_ESCALATE_ON_SUBMIT", "true"),
            ("QC_RNG_SEED", "42"),
            ("LEASE_DURATION_MINUTES", "5"),
            ("SWEEP_INTERVAL_MS", "0"),
            ("QC_EVERY_N_SWEEPS", "3"),
        ]));
        assert!(!config.worker_enabled);
        assert!(!config.qc_create_audit_assignments);
        assert!(config.escalate_on_submit);
        assert_eq!(config.qc_rng_seed, Some(42));
        assert_eq!(config.lease_duration(), Duration::minutes(5));
        assert_eq!(config.sweep_interval_ms, 1);
        assert_eq!(config.qc_every_n_sweeps, 3);
    }

    #[test]
    fn test_invalid_lease_falls_back() {
        let config = WorkflowConfig::from_lookup(lookup(&[("LEASE_DURATION_MINUTES", "-3")]));
        assert_eq!(config.lease_duration_minutes, 20);
    }

    #[test]
    fn test_marker_list_parsing() {
        let config =
            WorkflowConfig::from_lookup(lookup(&[("BOOLEAN_TASK_MARKERS", " cta , Flag,,")]));
        assert_eq!(config.boolean_task_markers, vec!["cta", "Flag"]);
        let normalizer = config.normalizer();
        assert!(normalizer.is_boolean_task("StenosisFLAG"));
    }

    #[test]
    fn test_evaluation_confidence_bounds() {
        let config = WorkflowConfig::from_lookup(lookup(&[
            ("EVAL_CONFIDENCE", "1.0"),
            ("EVAL_MCNEMAR_MIN_PAIRS", "4"),
        ]));
        let eval = config.evaluation();
        assert_eq!(eval.confidence, 0.95);
        assert_eq!(eval.mcnemar_min_pairs, 4);
    }
}
