//! Merge gate and final document assembly.
//!
//! The gate is evaluated per non-excluded paragraph:
//! - status must be `ready_to_merge` or `merged`
//! - source hash == paragraph-state hash == translated-artifact hash
//!
//! Paragraphs in `rework_queued` or `manual_review_required` and run-level
//! review blockers also block. Only an empty blocker list lets the merged
//! document be written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::paragraph::{ParagraphBook, ParagraphStatus, content_hash};
use crate::tools::{SourceParagraph, TextRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    NotReady,
    ReworkQueued,
    ManualReviewRequired,
    MissingSource,
    SourceHashMismatch,
    MissingTranslation,
    TranslationHashMismatch,
    UnknownTranslation,
    RunBlocker,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::NotReady => "not_ready",
            BlockReason::ReworkQueued => "rework_queued",
            BlockReason::ManualReviewRequired => "manual_review_required",
            BlockReason::MissingSource => "missing_source",
            BlockReason::SourceHashMismatch => "source_hash_mismatch",
            BlockReason::MissingTranslation => "missing_translation",
            BlockReason::TranslationHashMismatch => "translation_hash_mismatch",
            BlockReason::UnknownTranslation => "unknown_translation",
            BlockReason::RunBlocker => "run_blocker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub reason: BlockReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paragraph_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Blocker {
    fn paragraph(reason: BlockReason, paragraph_id: &str, detail: Option<String>) -> Self {
        Self {
            reason,
            paragraph_id: Some(paragraph_id.to_string()),
            detail,
        }
    }
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason.as_str())?;
        if let Some(id) = &self.paragraph_id {
            write!(f, ":{id}")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// `final/merge_gate_report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub run_id: String,
    pub cycle: u32,
    pub passed: bool,
    pub evaluated_at: DateTime<Utc>,
    pub required_paragraphs: usize,
    pub excluded_paragraphs: usize,
    pub blockers: Vec<Blocker>,
}

impl GateReport {
    pub fn blocker_summaries(&self) -> Vec<String> {
        self.blockers.iter().map(ToString::to_string).collect()
    }
}

/// Everything the gate looks at.
pub struct GateInputs<'a> {
    pub run_id: &'a str,
    pub cycle: u32,
    pub book: &'a ParagraphBook,
    pub sources: &'a [SourceParagraph],
    pub translations: &'a [TextRow],
    pub run_blockers: &'a [String],
}

/// Evaluate the gate. Pure; the caller persists the report.
pub fn evaluate(inputs: &GateInputs<'_>, now: DateTime<Utc>) -> GateReport {
    let sources: BTreeMap<&str, &SourceParagraph> = inputs
        .sources
        .iter()
        .map(|s| (s.paragraph_id.as_str(), s))
        .collect();
    let translations: BTreeMap<&str, &TextRow> = inputs
        .translations
        .iter()
        .map(|t| (t.paragraph_id.as_str(), t))
        .collect();

    let mut blockers = Vec::new();
    let mut required = 0usize;

    for record in inputs.book.active() {
        required += 1;
        let id = record.paragraph_id.as_str();

        match record.status {
            ParagraphStatus::ReadyToMerge | ParagraphStatus::Merged => {}
            ParagraphStatus::ReworkQueued => {
                blockers.push(Blocker::paragraph(BlockReason::ReworkQueued, id, None));
            }
            ParagraphStatus::ManualReviewRequired => {
                blockers.push(Blocker::paragraph(
                    BlockReason::ManualReviewRequired,
                    id,
                    record.blocking_issues.first().cloned(),
                ));
            }
            other => {
                blockers.push(Blocker::paragraph(
                    BlockReason::NotReady,
                    id,
                    Some(other.to_string()),
                ));
            }
        }

        match sources.get(id) {
            None => blockers.push(Blocker::paragraph(BlockReason::MissingSource, id, None)),
            Some(source) => {
                let source_hash = content_hash(&source.text);
                if source_hash != record.content_hash {
                    blockers.push(Blocker::paragraph(
                        BlockReason::SourceHashMismatch,
                        id,
                        Some(format!("state {} != source {}", record.content_hash, source_hash)),
                    ));
                }
            }
        }

        match translations.get(id) {
            None => blockers.push(Blocker::paragraph(BlockReason::MissingTranslation, id, None)),
            Some(row) if row.content_hash != record.content_hash => {
                blockers.push(Blocker::paragraph(
                    BlockReason::TranslationHashMismatch,
                    id,
                    Some(format!(
                        "translation {} != state {}",
                        row.content_hash, record.content_hash
                    )),
                ));
            }
            Some(_) => {}
        }
    }

    for row in inputs.translations {
        if inputs.book.get(&row.paragraph_id).is_none() {
            blockers.push(Blocker::paragraph(
                BlockReason::UnknownTranslation,
                &row.paragraph_id,
                None,
            ));
        }
    }

    for blocker in inputs.run_blockers {
        blockers.push(Blocker {
            reason: BlockReason::RunBlocker,
            paragraph_id: None,
            detail: Some(blocker.clone()),
        });
    }

    GateReport {
        run_id: inputs.run_id.to_string(),
        cycle: inputs.cycle,
        passed: blockers.is_empty(),
        evaluated_at: now,
        required_paragraphs: required,
        excluded_paragraphs: inputs.book.len() - required,
        blockers,
    }
}

/// Assemble the merged document in source order.
///
/// Excluded paragraphs contribute their source text unchanged. Only call
/// after [`evaluate`] passed.
pub fn render_merged(book: &ParagraphBook, sources: &[SourceParagraph], translations: &[TextRow]) -> String {
    let translated: BTreeMap<&str, &str> = translations
        .iter()
        .map(|t| (t.paragraph_id.as_str(), t.text.as_str()))
        .collect();

    let parts: Vec<&str> = sources
        .iter()
        .filter_map(|source| {
            let record = book.get(&source.paragraph_id)?;
            if record.excluded_by_policy {
                Some(source.text.as_str())
            } else {
                translated.get(source.paragraph_id.as_str()).copied()
            }
        })
        .map(str::trim_end)
        .collect();

    let mut out = parts.join("\n\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paragraph::{ParagraphRecord, content_hash};
    use std::path::Path;

    struct Fixture {
        book: ParagraphBook,
        sources: Vec<SourceParagraph>,
        translations: Vec<TextRow>,
    }

    fn fixture(statuses: &[(&str, &str, ParagraphStatus, bool)]) -> Fixture {
        let now = Utc::now();
        let mut records = Vec::new();
        let mut sources = Vec::new();
        let mut translations = Vec::new();
        for (id, text, status, excluded) in statuses {
            let hash = content_hash(text);
            let mut r = ParagraphRecord::seeded(id, &hash, *excluded, now);
            r.status = *status;
            records.push(r);
            sources.push(SourceParagraph {
                paragraph_id: id.to_string(),
                text: text.to_string(),
            });
            if !excluded {
                translations.push(TextRow {
                    paragraph_id: id.to_string(),
                    content_hash: hash,
                    text: format!("[de] {text}"),
                });
            }
        }
        Fixture {
            book: ParagraphBook::from_records(Path::new("state.jsonl"), records).unwrap(),
            sources,
            translations,
        }
    }

    fn run_gate(f: &Fixture, run_blockers: &[String]) -> GateReport {
        evaluate(
            &GateInputs {
                run_id: "r1",
                cycle: 0,
                book: &f.book,
                sources: &f.sources,
                translations: &f.translations,
                run_blockers,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_all_ready_passes_and_renders_in_source_order() {
        let mut f = fixture(&[
            ("p_0001", "One.", ParagraphStatus::ReadyToMerge, false),
            ("p_0002", "Two.", ParagraphStatus::Ingested, true),
            ("p_0003", "Three.", ParagraphStatus::ReadyToMerge, false),
        ]);
        f.translations.reverse();

        let report = run_gate(&f, &[]);
        assert!(report.passed, "{:?}", report.blockers);
        assert_eq!(report.required_paragraphs, 2);
        assert_eq!(report.excluded_paragraphs, 1);

        let merged = render_merged(&f.book, &f.sources, &f.translations);
        assert_eq!(merged, "[de] One.\n\nTwo.\n\n[de] Three.\n");
    }

    #[test]
    fn test_single_translation_hash_mismatch_blocks() {
        let mut f = fixture(&[
            ("p_0001", "One.", ParagraphStatus::ReadyToMerge, false),
            ("p_0002", "Two.", ParagraphStatus::ReadyToMerge, false),
            ("p_0003", "Three.", ParagraphStatus::ReadyToMerge, false),
        ]);
        f.translations[1].content_hash = content_hash("Two, edited.");

        let report = run_gate(&f, &[]);
        assert!(!report.passed);
        assert_eq!(report.blockers.len(), 1);
        assert_eq!(report.blockers[0].reason, BlockReason::TranslationHashMismatch);
        assert_eq!(report.blockers[0].paragraph_id.as_deref(), Some("p_0002"));
    }

    #[test]
    fn test_source_drift_blocks() {
        let mut f = fixture(&[("p_0001", "One.", ParagraphStatus::ReadyToMerge, false)]);
        f.sources[0].text = "One, rewritten.".into();

        let report = run_gate(&f, &[]);
        assert_eq!(report.blockers[0].reason, BlockReason::SourceHashMismatch);
    }

    #[test]
    fn test_rework_and_manual_review_are_automatic_blockers() {
        let f = fixture(&[
            ("p_0001", "One.", ParagraphStatus::ReworkQueued, false),
            ("p_0002", "Two.", ParagraphStatus::ManualReviewRequired, false),
            ("p_0003", "Three.", ParagraphStatus::ReviewInProgress, false),
        ]);
        let reasons: Vec<BlockReason> = run_gate(&f, &[]).blockers.iter().map(|b| b.reason).collect();
        assert_eq!(
            reasons,
            vec![
                BlockReason::ReworkQueued,
                BlockReason::ManualReviewRequired,
                BlockReason::NotReady
            ]
        );
    }

    #[test]
    fn test_run_level_blockers_block() {
        let f = fixture(&[("p_0001", "One.", ParagraphStatus::ReadyToMerge, false)]);
        let report = run_gate(&f, &["unresolved_mapping_error".to_string()]);
        assert!(!report.passed);
        assert_eq!(
            report.blocker_summaries(),
            vec!["run_blocker (unresolved_mapping_error)".to_string()]
        );
    }

    #[test]
    fn test_missing_translation_blocks() {
        let mut f = fixture(&[("p_0001", "One.", ParagraphStatus::ReadyToMerge, false)]);
        f.translations.clear();
        let report = run_gate(&f, &[]);
        assert_eq!(report.blocker_summaries(), vec!["missing_translation:p_0001".to_string()]);
    }
}
