//! Paragraph state model.
//!
//! - [`ParagraphStatus`]: the fixed status enumeration
//! - [`ParagraphRecord`]: one line of `paragraph_state.jsonl`
//! - [`transitions`]: the compiled-in state graph and its guard
//! - [`review`]: the pure review state machine
//! - [`book`]: the in-memory paragraph-state file with guarded writes

pub mod book;
pub mod review;
pub mod transitions;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub use book::{ParagraphBook, SeedRow};
pub use review::{ReviewOutcome, ReviewPolicy, ReviewResolution, ReworkReentry, resolve};
pub use transitions::assert_pipeline_transition_allowed;

/// Status of a paragraph in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParagraphStatus {
    Ingested,
    TranslatedPass1,
    TranslatedPass2,
    CandidateAssembled,
    ReviewInProgress,
    /// Transient signal from the review state machine; never persisted.
    ReviewFailed,
    ReadyToMerge,
    ReworkQueued,
    Reworked,
    ManualReviewRequired,
    Merged,
}

impl ParagraphStatus {
    pub const ALL: [ParagraphStatus; 11] = [
        Self::Ingested,
        Self::TranslatedPass1,
        Self::TranslatedPass2,
        Self::CandidateAssembled,
        Self::ReviewInProgress,
        Self::ReviewFailed,
        Self::ReadyToMerge,
        Self::ReworkQueued,
        Self::Reworked,
        Self::ManualReviewRequired,
        Self::Merged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingested => "ingested",
            Self::TranslatedPass1 => "translated_pass1",
            Self::TranslatedPass2 => "translated_pass2",
            Self::CandidateAssembled => "candidate_assembled",
            Self::ReviewInProgress => "review_in_progress",
            Self::ReviewFailed => "review_failed",
            Self::ReadyToMerge => "ready_to_merge",
            Self::ReworkQueued => "rework_queued",
            Self::Reworked => "reworked",
            Self::ManualReviewRequired => "manual_review_required",
            Self::Merged => "merged",
        }
    }

    /// No automatic transition ever leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ManualReviewRequired | Self::Merged)
    }

    /// Statuses an excluded paragraph may hold.
    pub fn is_inactive(&self) -> bool {
        matches!(self, Self::Ingested | Self::Merged)
    }
}

impl fmt::Display for ParagraphStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One failed review cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub attempt: u32,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Persisted state of one paragraph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParagraphRecord {
    pub paragraph_id: String,
    pub status: ParagraphStatus,
    #[serde(default)]
    pub attempt: u32,
    /// Digest of the source text. Immutable once seeded.
    pub content_hash: String,
    #[serde(default)]
    pub excluded_by_policy: bool,
    #[serde(default)]
    pub blocking_issues: Vec<String>,
    #[serde(default)]
    pub failure_history: Vec<FailureEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ParagraphRecord {
    /// A freshly ingested paragraph.
    pub fn seeded(
        paragraph_id: &str,
        content_hash: &str,
        excluded_by_policy: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            paragraph_id: paragraph_id.to_string(),
            status: ParagraphStatus::Ingested,
            attempt: 0,
            content_hash: content_hash.to_string(),
            excluded_by_policy,
            blocking_issues: Vec::new(),
            failure_history: Vec::new(),
            last_success_at: None,
            last_failure_at: None,
            updated_at: now,
        }
    }
}

/// Content-addressed digest of a paragraph's text (hex SHA-256).
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Dedup key of an issue code: the text before the first `": "`.
///
/// `critical_grammar: subject-verb` keys as `critical_grammar`;
/// `score_below_threshold:fluency` has no `": "` and keys as itself.
pub fn issue_key(issue: &str) -> &str {
    match issue.find(": ") {
        Some(idx) => issue[..idx].trim(),
        None => issue.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ParagraphStatus::ManualReviewRequired).unwrap();
        assert_eq!(json, "\"manual_review_required\"");
        let back: ParagraphStatus = serde_json::from_str("\"translated_pass1\"").unwrap();
        assert_eq!(back, ParagraphStatus::TranslatedPass1);
    }

    #[test]
    fn test_display_matches_serde_name() {
        for status in ParagraphStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json.trim_matches('"'), status.to_string());
        }
    }

    #[test]
    fn test_content_hash_is_stable_hex() {
        let a = content_hash("Hello, world.");
        assert_eq!(a.len(), 64);
        assert_eq!(a, content_hash("Hello, world."));
        assert_ne!(a, content_hash("Hello, world!"));
    }

    #[test]
    fn test_issue_key() {
        assert_eq!(issue_key("critical_grammar: subject-verb"), "critical_grammar");
        assert_eq!(issue_key("score_below_threshold:fluency"), "score_below_threshold:fluency");
        assert_eq!(issue_key("  typo  "), "typo");
    }

    #[test]
    fn test_record_defaults_when_fields_missing() {
        let json = r#"{"paragraph_id":"p_0001","status":"ingested","content_hash":"abc","updated_at":"2026-01-01T00:00:00Z"}"#;
        let record: ParagraphRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.attempt, 0);
        assert!(!record.excluded_by_policy);
        assert!(record.failure_history.is_empty());
    }
}
