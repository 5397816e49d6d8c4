//! Statistical evaluation over converged case data.
//!
//! Everything here is a pure function of already-normalized rows: percent
//! agreement and Cohen's kappa (automated vs round 1), accuracy against gold
//! with Wilson score intervals, and McNemar's paired test.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults::{EVAL_CONFIDENCE, MCNEMAR_MIN_PAIRS};
use crate::models::EvaluationSourceRow;
use crate::normalize::LabelNormalizer;

// =============================================================================
// AGREEMENT
// =============================================================================

/// Fraction of pairs whose two labels are identical. `None` for no pairs.
pub fn percent_agreement<A: AsRef<str>, B: AsRef<str>>(pairs: &[(A, B)]) -> Option<f64> {
    if pairs.is_empty() {
        return None;
    }
    let agree = pairs.iter().filter(|(a, b)| a.as_ref() == b.as_ref()).count();
    Some(agree as f64 / pairs.len() as f64)
}

/// Cohen's kappa for two raters over nominal labels.
///
/// Undefined (`None`) when there are no pairs, fewer than two distinct labels
/// across both raters, or chance agreement is 1.
pub fn cohens_kappa<A: AsRef<str>, B: AsRef<str>>(pairs: &[(A, B)]) -> Option<f64> {
    if pairs.is_empty() {
        return None;
    }

    let labels: BTreeSet<&str> = pairs
        .iter()
        .flat_map(|(a, b)| [a.as_ref(), b.as_ref()])
        .collect();
    if labels.len() < 2 {
        return None;
    }

    let n = pairs.len() as f64;
    let mut count_a: HashMap<&str, usize> = HashMap::new();
    let mut count_b: HashMap<&str, usize> = HashMap::new();
    let mut agree = 0usize;
    for (a, b) in pairs {
        *count_a.entry(a.as_ref()).or_default() += 1;
        *count_b.entry(b.as_ref()).or_default() += 1;
        if a.as_ref() == b.as_ref() {
            agree += 1;
        }
    }

    let po = agree as f64 / n;
    let pe: f64 = labels
        .iter()
        .map(|l| {
            let pa = *count_a.get(l).unwrap_or(&0) as f64 / n;
            let pb = *count_b.get(l).unwrap_or(&0) as f64 / n;
            pa * pb
        })
        .sum();

    if (1.0 - pe).abs() < 1e-12 {
        return None;
    }
    Some((po - pe) / (1.0 - pe))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementSummary {
    pub n: usize,
    pub percent_agreement: f64,
    /// `None` when kappa is undefined (insufficient label diversity).
    pub kappa: Option<f64>,
}

// =============================================================================
// ACCURACY / WILSON
// =============================================================================

/// Two-sided standard normal quantile for a confidence level in (0, 1).
///
/// Uses Acklam's rational approximation of the inverse normal CDF
/// (relative error below 1.2e-9).
pub fn z_for_confidence(confidence: f64) -> Option<f64> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return None;
    }
    Some(inverse_normal_cdf(1.0 - (1.0 - confidence) / 2.0))
}

fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.024_25;

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}

/// Wilson score interval for `successes` out of `n`, clamped to [0, 1].
///
/// `None` when `n` is zero or the confidence level is outside (0, 1).
pub fn wilson_interval(successes: usize, n: usize, confidence: f64) -> Option<(f64, f64)> {
    if n == 0 || successes > n {
        return None;
    }
    let z = z_for_confidence(confidence)?;
    let n_f = n as f64;
    let p = successes as f64 / n_f;
    let z2 = z * z;
    let denom = 1.0 + z2 / n_f;
    let center = (p + z2 / (2.0 * n_f)) / denom;
    let half = z * ((p * (1.0 - p) + z2 / (4.0 * n_f)) / n_f).sqrt() / denom;
    Some(((center - half).max(0.0), (center + half).min(1.0)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyEstimate {
    pub n: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Accuracy of predictions against gold with a Wilson interval.
pub fn accuracy_with_wilson<P: AsRef<str>, G: AsRef<str>>(
    pairs: &[(P, G)],
    confidence: f64,
) -> Option<AccuracyEstimate> {
    let n = pairs.len();
    let correct = pairs.iter().filter(|(p, g)| p.as_ref() == g.as_ref()).count();
    let (lower, upper) = wilson_interval(correct, n, confidence)?;
    Some(AccuracyEstimate {
        n,
        correct,
        accuracy: correct as f64 / n as f64,
        lower,
        upper,
    })
}

// =============================================================================
// MCNEMAR
// =============================================================================

/// Error function, Abramowitz & Stegun 7.1.26 (absolute error below 1.5e-7).
pub fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McNemarResult {
    /// Automated wrong, round 1 right.
    pub b: usize,
    /// Automated right, round 1 wrong.
    pub c: usize,
    pub chi_square: f64,
    pub p_value: f64,
}

/// McNemar's test without continuity correction.
///
/// Each item is `(automated_correct, round1_correct)`. With no discordant
/// pairs the statistic is 0 and p is 1.
pub fn mcnemar<I>(paired: I) -> McNemarResult
where
    I: IntoIterator<Item = (bool, bool)>,
{
    let (mut b, mut c) = (0usize, 0usize);
    for (automated_correct, round1_correct) in paired {
        match (automated_correct, round1_correct) {
            (false, true) => b += 1,
            (true, false) => c += 1,
            _ => {}
        }
    }

    if b + c == 0 {
        return McNemarResult {
            b,
            c,
            chi_square: 0.0,
            p_value: 1.0,
        };
    }

    let diff = b as f64 - c as f64;
    let chi_square = diff * diff / (b + c) as f64;
    // Survival function of chi-square with one degree of freedom.
    let p_value = (1.0 - erf((chi_square / 2.0).sqrt())).clamp(0.0, 1.0);
    McNemarResult {
        b,
        c,
        chi_square,
        p_value,
    }
}

/// Whether McNemar's test applied to a task, and why not if it didn't.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum McNemarOutcome {
    Computed { n: usize, result: McNemarResult },
    /// Gold labels are not binary.
    NotBinary { n: usize, labels: usize },
    /// Fewer fully paired cases than the configured minimum.
    Undersized { n: usize, min_pairs: usize },
}

// =============================================================================
// PER-TASK EVALUATION
// =============================================================================

/// One case with normalized values from every source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRow {
    pub case_id: Uuid,
    pub task_type: String,
    pub automated: Option<String>,
    pub round1: Option<String>,
    pub round2: Option<String>,
    pub gold: Option<String>,
}

impl EvaluationRow {
    /// Normalize a raw row. Task types are grouped case-insensitively, and an
    /// extraction that failed to parse counts as missing.
    pub fn from_source(src: &EvaluationSourceRow, normalizer: &LabelNormalizer) -> Self {
        let task_type = src.task_type.trim().to_ascii_uppercase();
        let automated = if src.automated_parsed_ok {
            normalizer.normalize(&task_type, src.automated.as_deref())
        } else {
            None
        };
        Self {
            case_id: src.case_id,
            automated,
            round1: normalizer.normalize(&task_type, src.round1.as_deref()),
            round2: normalizer.normalize(&task_type, src.round2.as_deref()),
            gold: normalizer.normalize(&task_type, src.gold.as_deref()),
            task_type,
        }
    }
}

/// Presence and disagreement counts for one task type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCounts {
    pub n: usize,
    pub round1_present: usize,
    pub round2_present: usize,
    pub gold_present: usize,
    pub automated_present: usize,
    pub round1_eq_automated: usize,
    pub round1_ne_automated: usize,
    pub round1_ne_round2: usize,
    pub gold_ne_round1: usize,
    pub gold_ne_automated: usize,
}

impl FlowCounts {
    pub fn compute(rows: &[&EvaluationRow]) -> Self {
        let mut flow = FlowCounts {
            n: rows.len(),
            ..Default::default()
        };
        for row in rows {
            flow.round1_present += row.round1.is_some() as usize;
            flow.round2_present += row.round2.is_some() as usize;
            flow.gold_present += row.gold.is_some() as usize;
            flow.automated_present += row.automated.is_some() as usize;

            if let (Some(r1), Some(auto)) = (&row.round1, &row.automated) {
                if r1 == auto {
                    flow.round1_eq_automated += 1;
                } else {
                    flow.round1_ne_automated += 1;
                }
            }
            if let (Some(r1), Some(r2)) = (&row.round1, &row.round2) {
                flow.round1_ne_round2 += (r1 != r2) as usize;
            }
            if let (Some(gold), Some(r1)) = (&row.gold, &row.round1) {
                flow.gold_ne_round1 += (gold != r1) as usize;
            }
            if let (Some(gold), Some(auto)) = (&row.gold, &row.automated) {
                flow.gold_ne_automated += (gold != auto) as usize;
            }
        }
        flow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub confidence: f64,
    pub mcnemar_min_pairs: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            confidence: EVAL_CONFIDENCE,
            mcnemar_min_pairs: MCNEMAR_MIN_PAIRS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvaluation {
    pub task_type: String,
    pub flow: FlowCounts,
    /// Automated vs round 1, where both are present.
    pub agreement: Option<AgreementSummary>,
    pub automated_accuracy: Option<AccuracyEstimate>,
    pub round1_accuracy: Option<AccuracyEstimate>,
    pub mcnemar: McNemarOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub confidence: f64,
    pub total_cases: usize,
    /// Sorted by task type.
    pub tasks: Vec<TaskEvaluation>,
    pub overall_automated_accuracy: Option<AccuracyEstimate>,
    pub overall_round1_accuracy: Option<AccuracyEstimate>,
}

/// Evaluate one task's rows.
pub fn evaluate_task(
    task_type: &str,
    rows: &[&EvaluationRow],
    config: &EvaluationConfig,
) -> TaskEvaluation {
    let flow = FlowCounts::compute(rows);

    let agree_pairs: Vec<(&str, &str)> = rows
        .iter()
        .filter_map(|r| Some((r.automated.as_deref()?, r.round1.as_deref()?)))
        .collect();
    let agreement = percent_agreement(&agree_pairs).map(|pct| AgreementSummary {
        n: agree_pairs.len(),
        percent_agreement: pct,
        kappa: cohens_kappa(&agree_pairs),
    });

    let (automated_accuracy, round1_accuracy) =
        accuracy_pair(rows.iter().copied(), config.confidence);

    let paired: Vec<(&str, &str, &str)> = rows
        .iter()
        .filter_map(|r| {
            Some((
                r.gold.as_deref()?,
                r.automated.as_deref()?,
                r.round1.as_deref()?,
            ))
        })
        .collect();
    let mcnemar_outcome = if paired.len() < config.mcnemar_min_pairs {
        McNemarOutcome::Undersized {
            n: paired.len(),
            min_pairs: config.mcnemar_min_pairs,
        }
    } else {
        let labels: BTreeSet<&str> = paired.iter().map(|(gold, _, _)| *gold).collect();
        if labels.len() != 2 {
            McNemarOutcome::NotBinary {
                n: paired.len(),
                labels: labels.len(),
            }
        } else {
            McNemarOutcome::Computed {
                n: paired.len(),
                result: mcnemar(
                    paired
                        .iter()
                        .map(|(gold, auto, r1)| (auto == gold, r1 == gold)),
                ),
            }
        }
    };

    TaskEvaluation {
        task_type: task_type.to_string(),
        flow,
        agreement,
        automated_accuracy,
        round1_accuracy,
        mcnemar: mcnemar_outcome,
    }
}

/// Evaluate every task type plus the overall accuracy summary.
pub fn evaluate(rows: &[EvaluationRow], config: &EvaluationConfig) -> Evaluation {
    let mut by_task: BTreeMap<&str, Vec<&EvaluationRow>> = BTreeMap::new();
    for row in rows {
        by_task.entry(row.task_type.as_str()).or_default().push(row);
    }

    let tasks = by_task
        .iter()
        .map(|(task, task_rows)| evaluate_task(task, task_rows, config))
        .collect();

    let (overall_automated_accuracy, overall_round1_accuracy) =
        accuracy_pair(rows.iter(), config.confidence);

    Evaluation {
        confidence: config.confidence,
        total_cases: rows.len(),
        tasks,
        overall_automated_accuracy,
        overall_round1_accuracy,
    }
}

fn accuracy_pair<'a, I>(
    rows: I,
    confidence: f64,
) -> (Option<AccuracyEstimate>, Option<AccuracyEstimate>)
where
    I: Iterator<Item = &'a EvaluationRow> + Clone,
{
    let automated: Vec<(&str, &str)> = rows
        .clone()
        .filter_map(|r| Some((r.automated.as_deref()?, r.gold.as_deref()?)))
        .collect();
    let round1: Vec<(&str, &str)> = rows
        .filter_map(|r| Some((r.round1.as_deref()?, r.gold.as_deref()?)))
        .collect();
    (
        accuracy_with_wilson(&automated, confidence),
        accuracy_with_wilson(&round1, confidence),
    )
}
