//! Evaluation report over converged case data.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use medeval_core::stats::evaluate;
use medeval_core::{
    AccuracyEstimate, Evaluation, EvaluationConfig, EvaluationRow, LabelNormalizer,
    McNemarOutcome, Repositories, Result, TaskEvaluation,
};

const RULE_WIDTH: usize = 70;

const NOTES: [&str; 3] = [
    "Gold is the case's final gold label (auto-confirm, agreement or adjudication).",
    "For multiple annotations per (case, round), the latest submission is used.",
    "The automated value is the latest extraction per case; unparsed output counts as missing.",
];

/// A generated report: the statistics plus when they were computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub generated_at: DateTime<Utc>,
    pub evaluation: Evaluation,
}

impl EvaluationReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Plain-text rendering, one section per task type plus an overall block.
    pub fn render_text(&self) -> String {
        let eval = &self.evaluation;
        let ci = ci_label(eval.confidence);
        let mut out = String::new();

        let _ = writeln!(out, "Extraction Evaluation Report");
        let _ = writeln!(out, "GeneratedAt: {}", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Tasks: {}  |  Total cases analyzed: {}",
            eval.tasks.len(),
            eval.total_cases
        );
        let _ = writeln!(out);

        for task in &eval.tasks {
            render_task(&mut out, task, &ci);
        }

        let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
        let _ = writeln!(out, "Overall (all tasks combined) accuracy vs Gold");
        render_accuracy(&mut out, "Automated", eval.overall_automated_accuracy.as_ref(), &ci);
        render_accuracy(&mut out, "R1", eval.overall_round1_accuracy.as_ref(), &ci);
        let _ = writeln!(out);
        let _ = writeln!(out, "Notes:");
        for note in NOTES {
            let _ = writeln!(out, "- {note}");
        }
        out
    }
}

fn render_task(out: &mut String, task: &TaskEvaluation, ci: &str) {
    let flow = &task.flow;
    let n = flow.n;

    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(out, "Task: {}", task.task_type);
    let _ = writeln!(out, "N: {n}");
    let _ = writeln!(out);

    let _ = writeln!(out, "Flow");
    let _ = writeln!(out, "- R1 present: {}/{n}", flow.round1_present);
    let _ = writeln!(out, "- R2 present: {}/{n}", flow.round2_present);
    let _ = writeln!(out, "- Gold present: {}/{n}", flow.gold_present);
    let _ = writeln!(out, "- Automated present: {}/{n}", flow.automated_present);
    let _ = writeln!(out, "- R1 == Automated: {}", flow.round1_eq_automated);
    let _ = writeln!(out, "- R1 != Automated: {}", flow.round1_ne_automated);
    let _ = writeln!(out, "- R1 != R2: {}  (entered adjudication)", flow.round1_ne_round2);
    let _ = writeln!(out, "- Gold differs from R1: {}", flow.gold_ne_round1);
    let _ = writeln!(out, "- Gold differs from Automated: {}", flow.gold_ne_automated);
    let _ = writeln!(out);

    if let Some(agreement) = &task.agreement {
        let _ = writeln!(out, "Agreement (Automated vs R1)");
        let _ = writeln!(
            out,
            "- % agreement: {}  (n={})",
            percent(agreement.percent_agreement),
            agreement.n
        );
        match agreement.kappa {
            Some(kappa) => {
                let _ = writeln!(out, "- Cohen's kappa: {kappa:.4}");
            }
            None => {
                let _ = writeln!(out, "- Cohen's kappa: N/A (insufficient label diversity)");
            }
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "Accuracy vs Gold");
    render_accuracy(out, "Automated", task.automated_accuracy.as_ref(), ci);
    render_accuracy(out, "R1", task.round1_accuracy.as_ref(), ci);
    let _ = writeln!(out);

    let _ = writeln!(out, "Paired comparison (Automated vs R1) vs Gold");
    match &task.mcnemar {
        McNemarOutcome::Computed { n, result } => {
            let _ = writeln!(
                out,
                "- McNemar (chi-square, no continuity correction): X2={:.4}, p={}",
                result.chi_square,
                p_value(result.p_value)
            );
            let _ = writeln!(
                out,
                "- Discordant pairs: (Automated wrong, R1 correct)={}, \
                 (Automated correct, R1 wrong)={}  (n={n})",
                result.b, result.c
            );
        }
        McNemarOutcome::NotBinary { labels, .. } => {
            let _ = writeln!(out, "- McNemar skipped (Gold is not binary; labels={labels})");
        }
        McNemarOutcome::Undersized { n, min_pairs } => {
            let _ = writeln!(out, "- McNemar skipped (n={n} < {min_pairs} paired cases)");
        }
    }
    let _ = writeln!(out);
}

fn render_accuracy(out: &mut String, name: &str, acc: Option<&AccuracyEstimate>, ci: &str) {
    match acc {
        Some(acc) => {
            let _ = writeln!(
                out,
                "- {name}: accuracy={}  {ci}[{}, {}]  (n={})",
                percent(acc.accuracy),
                percent(acc.lower),
                percent(acc.upper),
                acc.n
            );
        }
        None => {
            let _ = writeln!(out, "- {name}: N/A (no paired Gold & {name})");
        }
    }
}

fn percent(v: f64) -> String {
    format!("{:.2}%", v * 100.0)
}

fn p_value(p: f64) -> String {
    if p != 0.0 && p < 1e-4 {
        format!("{p:.3e}")
    } else {
        format!("{p:.4}")
    }
}

fn ci_label(confidence: f64) -> String {
    let pct = confidence * 100.0;
    if (pct - pct.round()).abs() < 1e-9 {
        format!("{pct:.0}%CI")
    } else {
        format!("{pct:.1}%CI")
    }
}

/// Loads converged rows and computes the evaluation.
#[derive(Clone)]
pub struct EvaluationReporter {
    repos: Repositories,
    normalizer: LabelNormalizer,
    config: EvaluationConfig,
}

impl EvaluationReporter {
    pub fn new(repos: Repositories) -> Self {
        Self {
            repos,
            normalizer: LabelNormalizer::default(),
            config: EvaluationConfig::default(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: LabelNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_config(mut self, config: EvaluationConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the report. An empty `task_types` slice covers every task type.
    pub async fn build(&self, task_types: &[String]) -> Result<EvaluationReport> {
        let filter: Vec<String> = task_types
            .iter()
            .map(|t| t.trim().to_ascii_uppercase())
            .filter(|t| !t.is_empty())
            .collect();

        let rows: Vec<EvaluationRow> = self
            .repos
            .evaluation
            .load_rows(&filter)
            .await?
            .iter()
            .map(|src| EvaluationRow::from_source(src, &self.normalizer))
            .collect();

        let evaluation = evaluate(&rows, &self.config);
        info!(
            subsystem = "workflow",
            component = "report",
            op = "evaluate",
            cases = evaluation.total_cases,
            tasks = evaluation.tasks.len(),
            "Evaluation computed"
        );

        Ok(EvaluationReport {
            generated_at: Utc::now(),
            evaluation,
        })
    }
}
