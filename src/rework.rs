//! Rework queue projection.
//!
//! The queue is recomputed every cycle from paragraph state: one packet per
//! paragraph in `rework_queued`, sorted by id. An existing packet that is
//! canonically identical to the freshly derived one is reused as the same
//! allocation, so reruns over unchanged state write byte-identical output.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::errors::StateError;
use crate::paragraph::{FailureEntry, ParagraphBook, ParagraphStatus};
use crate::storage;

/// One paragraph awaiting another translation/review cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReworkPacket {
    pub paragraph_id: String,
    /// Copied from paragraph state, never recomputed.
    pub content_hash: String,
    pub attempt: u32,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    #[serde(default)]
    pub required_fixes: Vec<String>,
    #[serde(default)]
    pub failure_history: Vec<FailureEntry>,
}

impl ReworkPacket {
    /// Field-complete comparison that ignores the order of reason and fix lists.
    pub fn canonically_equal(&self, other: &ReworkPacket) -> bool {
        fn set(items: &[String]) -> BTreeSet<&str> {
            items.iter().map(String::as_str).collect()
        }

        self.paragraph_id == other.paragraph_id
            && self.content_hash == other.content_hash
            && self.attempt == other.attempt
            && set(&self.failure_reasons) == set(&other.failure_reasons)
            && set(&self.required_fixes) == set(&other.required_fixes)
            && self.failure_history == other.failure_history
    }
}

pub type ReworkQueue = Vec<Arc<ReworkPacket>>;

/// Project the rework queue from current paragraph state.
///
/// `required_fixes` holds the latest reviewer fixes per paragraph id;
/// `existing` is the previously persisted queue.
pub fn build_queue(
    book: &ParagraphBook,
    required_fixes: &HashMap<String, Vec<String>>,
    existing: &[Arc<ReworkPacket>],
) -> ReworkQueue {
    let previous: HashMap<&str, &Arc<ReworkPacket>> = existing
        .iter()
        .map(|p| (p.paragraph_id.as_str(), p))
        .collect();

    let mut queue: ReworkQueue = book
        .records()
        .iter()
        .filter(|r| r.status == ParagraphStatus::ReworkQueued && !r.excluded_by_policy)
        .map(|record| {
            let fresh = ReworkPacket {
                paragraph_id: record.paragraph_id.clone(),
                content_hash: record.content_hash.clone(),
                attempt: record.attempt,
                failure_reasons: record.blocking_issues.clone(),
                required_fixes: required_fixes
                    .get(&record.paragraph_id)
                    .cloned()
                    .unwrap_or_default(),
                failure_history: record.failure_history.clone(),
            };
            match previous.get(record.paragraph_id.as_str()) {
                Some(old) if old.canonically_equal(&fresh) => Arc::clone(old),
                _ => Arc::new(fresh),
            }
        })
        .collect();

    queue.sort_by(|a, b| a.paragraph_id.cmp(&b.paragraph_id));
    queue
}

/// Check every packet's hash against paragraph state.
pub fn verify_lineage(queue: &[Arc<ReworkPacket>], book: &ParagraphBook) -> Result<(), StateError> {
    for packet in queue {
        book.verify_hash(&packet.paragraph_id, &packet.content_hash, "rework_queue")?;
    }
    Ok(())
}

pub fn load_queue(path: &Path) -> Result<ReworkQueue, StateError> {
    let packets: Vec<ReworkPacket> = storage::read_jsonl(path)?;
    Ok(packets.into_iter().map(Arc::new).collect())
}

pub fn save_queue(path: &Path, queue: &[Arc<ReworkPacket>]) -> Result<(), StateError> {
    let rows: Vec<&ReworkPacket> = queue.iter().map(Arc::as_ref).collect();
    storage::write_jsonl_atomic(path, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paragraph::{ParagraphRecord, SeedRow};
    use chrono::Utc;
    use tempfile::tempdir;

    fn book_with(dir: &Path, entries: &[(&str, ParagraphStatus, &[&str])]) -> ParagraphBook {
        let now = Utc::now();
        let records = entries
            .iter()
            .map(|(id, status, issues)| {
                let mut r = ParagraphRecord::seeded(id, &format!("hash-{id}"), false, now);
                r.status = *status;
                r.attempt = 1;
                r.blocking_issues = issues.iter().map(|s| s.to_string()).collect();
                r
            })
            .collect();
        ParagraphBook::from_records(&dir.join("paragraph_state.jsonl"), records).unwrap()
    }

    #[test]
    fn test_queue_contains_only_rework_queued_sorted() {
        let dir = tempdir().unwrap();
        let book = book_with(
            dir.path(),
            &[
                ("p_0003", ParagraphStatus::ReworkQueued, &["typo"]),
                ("p_0001", ParagraphStatus::ReadyToMerge, &[]),
                ("p_0002", ParagraphStatus::ReworkQueued, &["style"]),
            ],
        );

        let queue = build_queue(&book, &HashMap::new(), &[]);
        let ids: Vec<&str> = queue.iter().map(|p| p.paragraph_id.as_str()).collect();
        assert_eq!(ids, vec!["p_0002", "p_0003"]);
        assert_eq!(queue[0].content_hash, "hash-p_0002");
        assert_eq!(queue[0].failure_reasons, vec!["style".to_string()]);
    }

    #[test]
    fn test_rerun_reuses_same_objects_and_bytes() {
        let dir = tempdir().unwrap();
        let book = book_with(
            dir.path(),
            &[
                ("p_0001", ParagraphStatus::ReworkQueued, &["typo", "style"]),
                ("p_0002", ParagraphStatus::ReworkQueued, &["grammar"]),
            ],
        );
        let fixes: HashMap<String, Vec<String>> =
            [("p_0001".to_string(), vec!["fix the typo".to_string()])].into();

        let first = build_queue(&book, &fixes, &[]);
        let second = build_queue(&book, &fixes, &first);

        for (a, b) in first.iter().zip(second.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }

        let path = dir.path().join("rework_queue.jsonl");
        save_queue(&path, &first).unwrap();
        let bytes_a = std::fs::read(&path).unwrap();
        save_queue(&path, &second).unwrap();
        let bytes_b = std::fs::read(&path).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn test_reordered_lists_still_reuse_existing_entry() {
        let dir = tempdir().unwrap();
        let book = book_with(
            dir.path(),
            &[("p_0001", ParagraphStatus::ReworkQueued, &["typo", "style"])],
        );
        let fresh = build_queue(&book, &HashMap::new(), &[]);

        let mut reordered = (*fresh[0]).clone();
        reordered.failure_reasons.reverse();
        let existing = vec![Arc::new(reordered)];

        let rebuilt = build_queue(&book, &HashMap::new(), &existing);
        assert!(Arc::ptr_eq(&rebuilt[0], &existing[0]));
    }

    #[test]
    fn test_changed_entry_is_rebuilt_and_departed_entries_vanish() {
        let dir = tempdir().unwrap();
        let book = book_with(
            dir.path(),
            &[("p_0001", ParagraphStatus::ReworkQueued, &["typo"])],
        );
        let stale = Arc::new(ReworkPacket {
            paragraph_id: "p_0001".into(),
            content_hash: "hash-p_0001".into(),
            attempt: 0,
            failure_reasons: vec!["typo".into()],
            required_fixes: vec![],
            failure_history: vec![],
        });
        let gone = Arc::new(ReworkPacket {
            paragraph_id: "p_0009".into(),
            ..(*stale).clone()
        });

        let queue = build_queue(&book, &HashMap::new(), &[stale.clone(), gone]);
        assert_eq!(queue.len(), 1);
        assert!(!Arc::ptr_eq(&queue[0], &stale));
        assert_eq!(queue[0].attempt, 1);
    }

    #[test]
    fn test_verify_lineage_rejects_foreign_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("paragraph_state.jsonl");
        let mut book = ParagraphBook::load(&path).unwrap();
        book.seed(
            &[SeedRow {
                paragraph_id: "p_0001".into(),
                content_hash: "real".into(),
                excluded: false,
            }],
            &path,
            Utc::now(),
        )
        .unwrap();

        let tampered = vec![Arc::new(ReworkPacket {
            paragraph_id: "p_0001".into(),
            content_hash: "tampered".into(),
            attempt: 1,
            failure_reasons: vec![],
            required_fixes: vec![],
            failure_history: vec![],
        })];
        assert!(matches!(
            verify_lineage(&tampered, &book),
            Err(StateError::LineageMismatch { .. })
        ));
    }
}
