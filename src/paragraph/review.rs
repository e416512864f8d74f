//! Paragraph review state machine.
//!
//! [`resolve`] is pure: it maps a prior paragraph record, one review
//! outcome, the review policy and a timestamp to the resulting status and
//! record. It performs no I/O and never consults the clock itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::{FailureEntry, ParagraphRecord, ParagraphStatus, issue_key};

/// Marker issue added when a failing cycle repeats an issue seen in an earlier failure.
pub const REPEATED_IDENTICAL_HARD_FAIL: &str = "repeated_identical_hard_fail";
/// Issue recorded when the review tool produced no row for a paragraph under review.
pub const MISSING_REVIEW_ROW: &str = "missing_review_row";
/// Prefix of score-threshold issues; the metric name follows the colon.
pub const SCORE_BELOW_THRESHOLD: &str = "score_below_threshold";

/// Default per-metric score thresholds.
pub const DEFAULT_SCORE_THRESHOLDS: &[(&str, f64)] = &[
    ("accuracy", 0.8),
    ("fluency", 0.75),
    ("terminology", 0.7),
];

/// Default issues that bypass rework and go straight to manual review.
pub const DEFAULT_IMMEDIATE_MANUAL_REVIEW: &[&str] =
    &["mistranslation_critical", "content_omission"];

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Where a reworked paragraph re-enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReworkReentry {
    /// Back through translation (`reworked -> translated_pass1`).
    #[default]
    Retranslate,
    /// Straight back to review (`reworked -> review_in_progress`).
    Review,
}

impl ReworkReentry {
    pub fn target(self) -> ParagraphStatus {
        match self {
            Self::Retranslate => ParagraphStatus::TranslatedPass1,
            Self::Review => ParagraphStatus::ReviewInProgress,
        }
    }
}

impl std::fmt::Display for ReworkReentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retranslate => write!(f, "retranslate"),
            Self::Review => write!(f, "review"),
        }
    }
}

/// Review policy applied by [`resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewPolicy {
    pub max_attempts: u32,
    /// Required metrics and their minimum scores. Ordered by metric name.
    pub score_thresholds: BTreeMap<String, f64>,
    pub immediate_manual_review: BTreeSet<String>,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            score_thresholds: DEFAULT_SCORE_THRESHOLDS
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            immediate_manual_review: DEFAULT_IMMEDIATE_MANUAL_REVIEW
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// One row of the review tool's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub paragraph_id: String,
    #[serde(default)]
    pub hard_fail: bool,
    #[serde(default)]
    pub blocking_issues: Vec<String>,
    /// Raw metric scores. Values may be numbers, numeric strings or garbage.
    #[serde(default)]
    pub scores: BTreeMap<String, Value>,
    #[serde(default)]
    pub required_fixes: Vec<String>,
}

impl ReviewOutcome {
    /// Outcome synthesized for a paragraph the review tool did not report on.
    pub fn missing(paragraph_id: &str) -> Self {
        Self {
            paragraph_id: paragraph_id.to_string(),
            hard_fail: true,
            blocking_issues: vec![MISSING_REVIEW_ROW.to_string()],
            ..Default::default()
        }
    }
}

/// Result of [`resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewResolution {
    /// What the review said this cycle (`ready_to_merge` or the transient `review_failed`).
    pub immediate: ParagraphStatus,
    /// Where a failed paragraph is routed; `None` when `immediate` is final.
    pub follow_up: Option<ParagraphStatus>,
    /// The record to persist, carrying [`Self::persisted_status`].
    pub record: ParagraphRecord,
}

impl ReviewResolution {
    pub fn persisted_status(&self) -> ParagraphStatus {
        self.follow_up.unwrap_or(self.immediate)
    }
}

/// Coerce a raw score to a number. Non-numeric values are `None`.
fn coerce_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// One `score_below_threshold:<metric>` issue per failing metric, ordered by metric name.
///
/// Missing and non-numeric scores fail.
pub fn evaluate_scores(scores: &BTreeMap<String, Value>, policy: &ReviewPolicy) -> Vec<String> {
    policy
        .score_thresholds
        .iter()
        .filter(|(metric, threshold)| {
            match scores.get(metric.as_str()).and_then(coerce_score) {
                Some(score) => score < **threshold,
                None => true,
            }
        })
        .map(|(metric, _)| format!("{SCORE_BELOW_THRESHOLD}:{metric}"))
        .collect()
}

/// Append issues not already present by [`issue_key`], keeping first occurrences.
fn merge_issues(into: &mut Vec<String>, issues: &[String]) {
    for issue in issues {
        let key = issue_key(issue);
        if !into.iter().any(|existing| issue_key(existing) == key) {
            into.push(issue.clone());
        }
    }
}

/// Resolve one review outcome against a paragraph's prior record.
pub fn resolve(
    prior: &ParagraphRecord,
    outcome: &ReviewOutcome,
    policy: &ReviewPolicy,
    now: DateTime<Utc>,
) -> ReviewResolution {
    let mut record = prior.clone();

    if prior.excluded_by_policy {
        let status = if prior.status == ParagraphStatus::Merged {
            ParagraphStatus::Merged
        } else {
            ParagraphStatus::Ingested
        };
        record.status = status;
        record.blocking_issues.clear();
        record.last_success_at = None;
        record.last_failure_at = None;
        return ReviewResolution {
            immediate: status,
            follow_up: None,
            record,
        };
    }

    record.attempt = prior.attempt.saturating_add(1);
    record.updated_at = now;

    let mut cycle_issues: Vec<String> = Vec::new();
    merge_issues(&mut cycle_issues, &outcome.blocking_issues);
    merge_issues(&mut cycle_issues, &evaluate_scores(&outcome.scores, policy));

    if !outcome.hard_fail && cycle_issues.is_empty() {
        record.status = ParagraphStatus::ReadyToMerge;
        record.blocking_issues.clear();
        record.last_success_at = Some(now);
        record.last_failure_at = None;
        return ReviewResolution {
            immediate: ParagraphStatus::ReadyToMerge,
            follow_up: None,
            record,
        };
    }

    let seen_before: BTreeSet<&str> = prior
        .failure_history
        .iter()
        .flat_map(|entry| entry.issues.iter().map(|i| issue_key(i)))
        .filter(|key| *key != REPEATED_IDENTICAL_HARD_FAIL)
        .collect();
    let repeated = cycle_issues
        .iter()
        .any(|issue| seen_before.contains(issue_key(issue)));
    if repeated {
        merge_issues(&mut cycle_issues, &[REPEATED_IDENTICAL_HARD_FAIL.to_string()]);
    }

    let mut blocking = prior.blocking_issues.clone();
    merge_issues(&mut blocking, &cycle_issues);
    record.blocking_issues = blocking;

    record.failure_history.push(FailureEntry {
        attempt: record.attempt,
        issues: cycle_issues.clone(),
        timestamp: now,
    });
    record.last_failure_at = Some(now);

    let needs_manual = record.attempt >= policy.max_attempts
        || repeated
        || cycle_issues
            .iter()
            .any(|issue| policy.immediate_manual_review.contains(issue_key(issue)));

    let routed = if needs_manual {
        ParagraphStatus::ManualReviewRequired
    } else {
        ParagraphStatus::ReworkQueued
    };
    record.status = routed;

    ReviewResolution {
        immediate: ParagraphStatus::ReviewFailed,
        follow_up: Some(routed),
        record,
    }
}
