//! External collaborators.
//!
//! The orchestrator launches ingest, translation, assembly, review and
//! rework tools as subprocesses and only looks at the documented artifacts
//! they leave behind:
//!
//! | tool      | reads                              | writes                                   |
//! |-----------|------------------------------------|------------------------------------------|
//! | ingest    | source document                    | `{paragraph_id, text}` JSONL             |
//! | translate | `{paragraph_id, content_hash, text}` JSONL | same shape, translated           |
//! | assemble  | `state/translations.jsonl`         | `final/candidate.jsonl`                  |
//! | review    | `final/candidate.jsonl`            | review rows JSONL + optional report JSON |
//! | rework    | rework packets joined with text    | `{paragraph_id, content_hash, text}` JSONL |

pub mod runner;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::errors::StateError;

pub use runner::{Placeholders, ToolRunner};

/// One paragraph of the source document, as emitted by ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceParagraph {
    pub paragraph_id: String,
    pub text: String,
}

/// A paragraph's text tagged with the hash of the source it derives from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRow {
    pub paragraph_id: String,
    pub content_hash: String,
    pub text: String,
}

/// Optional run-level review report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReport {
    #[serde(default)]
    pub run_blockers: Vec<String>,
}

/// A rework request handed to the rework tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReworkRequest {
    pub paragraph_id: String,
    pub content_hash: String,
    pub source_text: String,
    pub current_text: String,
    pub attempt: u32,
    pub failure_reasons: Vec<String>,
    pub required_fixes: Vec<String>,
}

/// Index rows by id, rejecting duplicates.
pub fn index_by_id<'a, T>(
    rows: &'a [T],
    id: impl Fn(&T) -> &str,
    file: &Path,
) -> Result<BTreeMap<&'a str, &'a T>, StateError> {
    let mut index = BTreeMap::new();
    for row in rows {
        let key = id(row);
        if index.insert(key, row).is_some() {
            return Err(StateError::DuplicateParagraph {
                paragraph_id: key.to_string(),
                file: file.to_path_buf(),
            });
        }
    }
    Ok(index)
}

/// Check that a tool returned exactly the submitted paragraphs, each once.
pub fn verify_returned_set(
    submitted: &[&str],
    returned: &[TextRow],
    file: &Path,
) -> Result<(), StateError> {
    let returned_ids = index_by_id(returned, |r| r.paragraph_id.as_str(), file)?;
    let submitted_set: HashSet<&str> = submitted.iter().copied().collect();

    for id in returned_ids.keys() {
        if !submitted_set.contains(id) {
            return Err(StateError::UnknownParagraph {
                paragraph_id: id.to_string(),
                context: file.display().to_string(),
            });
        }
    }
    for id in submitted {
        if !returned_ids.contains_key(id) {
            return Err(StateError::MissingParagraph {
                paragraph_id: id.to_string(),
                context: file.display().to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str) -> TextRow {
        TextRow {
            paragraph_id: id.into(),
            content_hash: "h".into(),
            text: "t".into(),
        }
    }

    #[test]
    fn test_verify_returned_set() {
        let file = Path::new("out.jsonl");
        assert!(verify_returned_set(&["a", "b"], &[row("b"), row("a")], file).is_ok());
        assert!(matches!(
            verify_returned_set(&["a", "b"], &[row("a")], file),
            Err(StateError::MissingParagraph { .. })
        ));
        assert!(matches!(
            verify_returned_set(&["a"], &[row("a"), row("z")], file),
            Err(StateError::UnknownParagraph { .. })
        ));
        assert!(matches!(
            verify_returned_set(&["a"], &[row("a"), row("a")], file),
            Err(StateError::DuplicateParagraph { .. })
        ));
    }

    #[test]
    fn test_review_report_defaults() {
        let report: ReviewReport = serde_json::from_str("{}").unwrap();
        assert!(report.run_blockers.is_empty());
    }
}
