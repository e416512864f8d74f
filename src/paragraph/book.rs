//! In-memory view of `paragraph_state.jsonl`.
//!
//! Records are kept in source order. Every status write is checked by
//! [`assert_pipeline_transition_allowed`](super::assert_pipeline_transition_allowed)
//! and every hash presented by a later stage is checked against the seeded
//! `content_hash`.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use super::{ParagraphRecord, ParagraphStatus, assert_pipeline_transition_allowed};
use crate::errors::StateError;
use crate::storage;

/// A source paragraph as produced by ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedRow {
    pub paragraph_id: String,
    pub content_hash: String,
    pub excluded: bool,
}

#[derive(Debug)]
pub struct ParagraphBook {
    path: PathBuf,
    records: Vec<ParagraphRecord>,
    index: HashMap<String, usize>,
}

impl ParagraphBook {
    /// Load the book from `path`. A missing file is an empty book.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let records: Vec<ParagraphRecord> = storage::read_jsonl(path)?;
        Self::from_records(path, records)
    }

    pub fn from_records(path: &Path, records: Vec<ParagraphRecord>) -> Result<Self, StateError> {
        let index = index_records(path, &records)?;
        Ok(Self {
            path: path.to_path_buf(),
            records,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Records in source order.
    pub fn records(&self) -> &[ParagraphRecord] {
        &self.records
    }

    pub fn get(&self, paragraph_id: &str) -> Option<&ParagraphRecord> {
        self.index.get(paragraph_id).map(|&i| &self.records[i])
    }

    pub fn require(&self, paragraph_id: &str, context: &str) -> Result<&ParagraphRecord, StateError> {
        self.get(paragraph_id)
            .ok_or_else(|| StateError::UnknownParagraph {
                paragraph_id: paragraph_id.to_string(),
                context: context.to_string(),
            })
    }

    /// Seed a fresh book from ingest output, or verify an existing one against it.
    ///
    /// On a rerun the ids, their order and their hashes must all be unchanged.
    pub fn seed(
        &mut self,
        rows: &[SeedRow],
        source_file: &Path,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let records: Vec<ParagraphRecord> = rows
            .iter()
            .map(|row| ParagraphRecord::seeded(&row.paragraph_id, &row.content_hash, row.excluded, now))
            .collect();
        index_records(source_file, &records)?;

        if self.records.is_empty() {
            *self = Self::from_records(&self.path, records)?;
            return Ok(());
        }

        for row in rows {
            let existing = self.require(&row.paragraph_id, "paragraph state")?;
            if existing.content_hash != row.content_hash {
                return Err(StateError::LineageMismatch {
                    paragraph_id: row.paragraph_id.clone(),
                    stage: "ingest".to_string(),
                    expected: existing.content_hash.clone(),
                    actual: row.content_hash.clone(),
                });
            }
        }
        if let Some(missing) = self
            .records
            .iter()
            .find(|r| !rows.iter().any(|row| row.paragraph_id == r.paragraph_id))
        {
            return Err(StateError::MissingParagraph {
                paragraph_id: missing.paragraph_id.clone(),
                context: source_file.display().to_string(),
            });
        }
        if let Some((line, (existing, row))) = self
            .records
            .iter()
            .zip(rows)
            .enumerate()
            .find(|(_, (existing, row))| existing.paragraph_id != row.paragraph_id)
        {
            return Err(StateError::Corrupt {
                path: source_file.to_path_buf(),
                line: line + 1,
                reason: format!(
                    "paragraph order changed: expected {}, found {}",
                    existing.paragraph_id, row.paragraph_id
                ),
            });
        }
        Ok(())
    }

    /// Fail with [`StateError::LineageMismatch`] unless `hash` matches the seeded hash.
    pub fn verify_hash(&self, paragraph_id: &str, hash: &str, stage: &str) -> Result<(), StateError> {
        let record = self.require(paragraph_id, stage)?;
        if record.content_hash != hash {
            return Err(StateError::LineageMismatch {
                paragraph_id: paragraph_id.to_string(),
                stage: stage.to_string(),
                expected: record.content_hash.clone(),
                actual: hash.to_string(),
            });
        }
        Ok(())
    }

    /// Move one paragraph to `to` through the transition guard.
    pub fn transition(
        &mut self,
        paragraph_id: &str,
        to: ParagraphStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let idx = self.position(paragraph_id)?;
        let record = &mut self.records[idx];
        assert_pipeline_transition_allowed(record, to)?;
        if record.status != to {
            record.status = to;
            record.updated_at = now;
        }
        Ok(())
    }

    /// Replace a record wholesale, e.g. with the output of the review state machine.
    ///
    /// The status change is guarded; identity fields may not change.
    pub fn replace(&mut self, updated: ParagraphRecord) -> Result<(), StateError> {
        let idx = self.position(&updated.paragraph_id)?;
        let current = &self.records[idx];
        assert_pipeline_transition_allowed(current, updated.status)?;
        if current.content_hash != updated.content_hash {
            return Err(StateError::LineageMismatch {
                paragraph_id: updated.paragraph_id.clone(),
                stage: "paragraph_state".to_string(),
                expected: current.content_hash.clone(),
                actual: updated.content_hash.clone(),
            });
        }
        if current.excluded_by_policy != updated.excluded_by_policy {
            return Err(StateError::ExcludedParagraphActivation {
                paragraph_id: updated.paragraph_id.clone(),
                to: updated.status.to_string(),
            });
        }
        self.records[idx] = updated;
        Ok(())
    }

    /// Ids of paragraphs currently in `status`, in source order.
    pub fn ids_with_status(&self, status: ParagraphStatus) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.paragraph_id.clone())
            .collect()
    }

    /// Non-excluded records, in source order.
    pub fn active(&self) -> impl Iterator<Item = &ParagraphRecord> {
        self.records.iter().filter(|r| !r.excluded_by_policy)
    }

    pub fn counts(&self) -> BTreeMap<ParagraphStatus, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    /// Atomically write the book back to its file.
    pub fn save(&self) -> Result<(), StateError> {
        storage::write_jsonl_atomic(&self.path, &self.records)
    }

    fn position(&self, paragraph_id: &str) -> Result<usize, StateError> {
        self.index
            .get(paragraph_id)
            .copied()
            .ok_or_else(|| StateError::UnknownParagraph {
                paragraph_id: paragraph_id.to_string(),
                context: "paragraph state".to_string(),
            })
    }
}

fn index_records(file: &Path, records: &[ParagraphRecord]) -> Result<HashMap<String, usize>, StateError> {
    let mut index = HashMap::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        if index.insert(record.paragraph_id.clone(), i).is_some() {
            return Err(StateError::DuplicateParagraph {
                paragraph_id: record.paragraph_id.clone(),
                file: file.to_path_buf(),
            });
        }
    }
    Ok(index)
}
