//! Label normalization for equality comparison across sources.
//!
//! Automated output, round-1, round-2 and gold labels are compared only after
//! normalization. Two labels are equal iff their normalized forms are
//! byte-identical.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::defaults::BOOLEAN_TASK_MARKERS;

/// Canonical value for empty, null-ish and "not mentioned" labels.
pub const NOT_MENTIONED: &str = "notmentioned";

const NULLISH_TOKENS: &[&str] = &["null", "none", "n/a", "na", "undefined", "未提及"];
const TRUE_TOKENS: &[&str] = &["true", "t", "yes", "y", "1", "positive", "pos", "是", "有"];
const FALSE_TOKENS: &[&str] = &["false", "f", "no", "n", "0", "negative", "neg", "否", "无"];

static NOT_MENTIONED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(not\s*mentioned|notmentioned|not_mentioned|unmentioned|unspecified)$")
        .expect("not-mentioned pattern is a valid regex")
});

/// Canonicalizes raw label text.
///
/// A task type is boolean-like when it contains one of the configured markers
/// (ASCII case-insensitive). Boolean-like tasks map the usual truthy/falsy
/// spellings to `"true"`/`"false"`.
#[derive(Debug, Clone)]
pub struct LabelNormalizer {
    boolean_markers: Vec<String>,
}

impl Default for LabelNormalizer {
    fn default() -> Self {
        Self::new(BOOLEAN_TASK_MARKERS.iter().map(|m| m.to_string()))
    }
}

impl LabelNormalizer {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            boolean_markers: markers
                .into_iter()
                .map(|m| m.into().trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn is_boolean_task(&self, task_type: &str) -> bool {
        let upper = task_type.to_ascii_uppercase();
        self.boolean_markers.iter().any(|m| upper.contains(m.as_str()))
    }

    /// Normalize a raw label. `None` stays `None`.
    pub fn normalize(&self, task_type: &str, raw: Option<&str>) -> Option<String> {
        let raw = raw?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Some(NOT_MENTIONED.to_string());
        }

        let lower = trimmed.replace("\r\n", "\n").replace('\r', "\n").to_lowercase();
        if NULLISH_TOKENS.contains(&lower.as_str()) || NOT_MENTIONED_RE.is_match(&lower) {
            return Some(NOT_MENTIONED.to_string());
        }

        if self.is_boolean_task(task_type) {
            if TRUE_TOKENS.contains(&lower.as_str()) {
                return Some("true".to_string());
            }
            if FALSE_TOKENS.contains(&lower.as_str()) {
                return Some("false".to_string());
            }
        }

        Some(lower)
    }

    /// Ordinal comparison of normalized forms. Two missing values are equal.
    pub fn equals(&self, task_type: &str, a: Option<&str>, b: Option<&str>) -> bool {
        self.normalize(task_type, a) == self.normalize(task_type, b)
    }
}

/// Heuristic for model output that is a refusal or non-answer rather than a label.
pub fn looks_like_refusal(raw: &str) -> bool {
    let text = raw.trim();
    if text.is_empty() {
        return true;
    }
    if text.contains("对不起") && text.contains("不能") {
        return true;
    }
    let lower = text.to_lowercase();
    lower.contains("i can't") || lower.contains("i cannot") || lower.contains("cannot comply")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTA: &str = "ExamCoronaryCTA";
    const NOMINAL: &str = "LesionLocation";

    #[test]
    fn test_none_stays_none() {
        let n = LabelNormalizer::default();
        assert_eq!(n.normalize(CTA, None), None);
    }

    #[test]
    fn test_empty_and_nullish_map_to_sentinel() {
        let n = LabelNormalizer::default();
        for raw in ["", "   ", "null", "NONE", "N/A", "na", "Undefined", "未提及"] {
            assert_eq!(n.normalize(NOMINAL, Some(raw)).as_deref(), Some(NOT_MENTIONED), "{raw:?}");
        }
    }

    #[test]
    fn test_not_mentioned_phrasings() {
        let n = LabelNormalizer::default();
        for raw in [
            "Not Mentioned",
            "not   mentioned",
            "NOT_MENTIONED",
            "unmentioned",
            "Unspecified",
        ] {
            assert_eq!(n.normalize(NOMINAL, Some(raw)).as_deref(), Some(NOT_MENTIONED), "{raw:?}");
        }
    }

    #[test]
    fn test_boolean_task_truthy_spellings() {
        let n = LabelNormalizer::default();
        for raw in ["YES", "y", "positive", "True", " 1 ", "pos", "是"] {
            assert_eq!(n.normalize(CTA, Some(raw)).as_deref(), Some("true"), "{raw:?}");
        }
        for raw in ["no", "N", "negative", "FALSE", "0", "否"] {
            assert_eq!(n.normalize(CTA, Some(raw)).as_deref(), Some("false"), "{raw:?}");
        }
    }

    #[test]
    fn test_non_boolean_task_only_lowercases() {
        let n = LabelNormalizer::default();
        assert_eq!(n.normalize(NOMINAL, Some(" YES ")).as_deref(), Some("yes"));
        assert_eq!(n.normalize(NOMINAL, Some("Left Main")).as_deref(), Some("left main"));
    }

    #[test]
    fn test_line_endings_are_unified() {
        let n = LabelNormalizer::default();
        assert_eq!(n.normalize(NOMINAL, Some("a\r\nb\rc")).as_deref(), Some("a\nb\nc"));
    }

    #[test]
    fn test_idempotent() {
        let n = LabelNormalizer::default();
        let inputs = [
            "", " Yes ", "n", "NULL", "Not mentioned", "LAD 70%", "a\r\nb", "否", "Positive", "x",
        ];
        for task in [CTA, NOMINAL] {
            for raw in inputs {
                let once = n.normalize(task, Some(raw));
                let twice = n.normalize(task, once.as_deref());
                assert_eq!(once, twice, "task={task} raw={raw:?}");
            }
        }
    }

    #[test]
    fn test_equals_is_normalized_comparison() {
        let n = LabelNormalizer::default();
        assert!(n.equals(CTA, Some("Yes"), Some("positive")));
        assert!(!n.equals(CTA, Some("yes"), Some("no")));
        assert!(n.equals(NOMINAL, Some("n/a"), Some("not mentioned")));
        assert!(!n.equals(NOMINAL, Some("x"), None));
    }

    #[test]
    fn test_custom_markers() {
        let n = LabelNormalizer::new(["flag", " "]);
        assert!(n.is_boolean_task("StenosisFlag"));
        assert!(!n.is_boolean_task("ExamCoronaryCTA"));
    }

    #[test]
    fn test_refusal_detection() {
        assert!(looks_like_refusal(""));
        assert!(looks_like_refusal("I can't help with that."));
        assert!(looks_like_refusal("Sorry, I cannot comply."));
        assert!(looks_like_refusal("对不起，我不能回答"));
        assert!(!looks_like_refusal("true"));
        assert!(!looks_like_refusal("对不起"));
    }
}
