//! Concrete phase handlers.
//!
//! Each handler loads the state it needs from disk, launches its external
//! tool, validates the returned artifact against paragraph state and writes
//! the result back through atomic replace. Nothing is carried in memory
//! between phases, so any phase can be re-run after a crash.

mod assemble;
mod bookkeeping;
mod ingest;
mod merge;
mod review;
mod rework;
mod translate;

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::errors::{LockError, StateError};
use crate::exclusion::ExclusionPolicy;
use crate::layout::RunLayout;
use crate::lock::{LockHandle, RunLock};
use crate::manifest::Manifest;
use crate::paragraph::{ParagraphBook, ReviewPolicy};
use crate::phase::{BeatError, Heartbeat, PhaseHandler, ProgressTracker};
use crate::storage;
use crate::tools::{Placeholders, SourceParagraph, TextRow, ToolRunner};

pub use assemble::AssemblePhase;
pub use bookkeeping::{BookkeepingPhase, ScoreRow};
pub use ingest::IngestPhase;
pub use merge::MergePhase;
pub use review::{ReviewPhase, RunBlockers};
pub use rework::ReworkPhase;
pub use translate::TranslatePhase;

/// Everything a phase handler needs, fixed for the whole invocation.
pub struct RunContext {
    pub layout: RunLayout,
    pub manifest: Manifest,
    pub policy: ReviewPolicy,
    pub exclusion: ExclusionPolicy,
    pub runner: ToolRunner,
}

impl RunContext {
    pub(crate) fn placeholders(&self, input: PathBuf, output: PathBuf, workdir: PathBuf, lang: &str) -> Placeholders {
        Placeholders {
            input,
            output,
            run_dir: self.layout.root().to_path_buf(),
            workdir,
            source: self.manifest.source_path.clone(),
            model: self.manifest.model.clone(),
            lang: lang.to_string(),
            source_lang: self.manifest.source_lang.clone(),
        }
    }

    pub(crate) fn load_book(&self) -> Result<ParagraphBook, StateError> {
        ParagraphBook::load(&self.layout.paragraph_state())
    }

    pub(crate) fn load_sources(&self) -> Result<Vec<SourceParagraph>, StateError> {
        storage::read_jsonl_required(&self.layout.ingest_output())
    }

    pub(crate) fn load_translations(&self) -> Result<Vec<TextRow>, StateError> {
        storage::read_jsonl(&self.layout.translations())
    }

    /// Merge `updates` into `state/translations.jsonl`, kept in source order.
    pub(crate) fn store_translations(
        &self,
        book: &ParagraphBook,
        current: Vec<TextRow>,
        updates: Vec<TextRow>,
    ) -> Result<(), StateError> {
        let mut by_id: BTreeMap<String, TextRow> = current
            .into_iter()
            .map(|row| (row.paragraph_id.clone(), row))
            .collect();
        for row in updates {
            by_id.insert(row.paragraph_id.clone(), row);
        }

        let mut ordered = Vec::with_capacity(by_id.len());
        for record in book.records() {
            if let Some(row) = by_id.remove(&record.paragraph_id) {
                ordered.push(row);
            }
        }
        if let Some(stray) = by_id.into_keys().next() {
            return Err(StateError::UnknownParagraph {
                paragraph_id: stray,
                context: self.layout.translations().display().to_string(),
            });
        }
        storage::write_jsonl_atomic(&self.layout.translations(), &ordered)
    }
}

/// Remove a tool output left over from an earlier attempt.
pub(crate) fn clear_artifact(path: &Path) -> Result<(), StateError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StateError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// All handlers, in no particular order; the cycle plan decides which run.
pub fn handlers() -> Vec<Box<dyn PhaseHandler<RunContext>>> {
    vec![
        Box::new(IngestPhase),
        Box::new(TranslatePhase::pass1()),
        Box::new(TranslatePhase::pass2()),
        Box::new(AssemblePhase),
        Box::new(ReviewPhase),
        Box::new(BookkeepingPhase),
        Box::new(MergePhase),
        Box::new(ReworkPhase),
    ]
}

/// Heartbeat for a held run lock: refresh the lock, then the progress record.
pub struct RunHeartbeat {
    lock: RunLock,
    handle: Mutex<LockHandle>,
    progress: Arc<ProgressTracker>,
    lost: Mutex<Option<String>>,
}

impl RunHeartbeat {
    pub fn new(lock: RunLock, handle: LockHandle, progress: Arc<ProgressTracker>) -> Self {
        Self {
            lock,
            handle: Mutex::new(handle),
            progress,
            lost: Mutex::new(None),
        }
    }

    /// Current handle; its identity changes with every heartbeat.
    pub fn handle(&self) -> LockHandle {
        self.handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Why ownership was lost, if a heartbeat found the lock no longer ours.
    pub fn lost_reason(&self) -> Option<String> {
        self.lost
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Heartbeat for RunHeartbeat {
    fn beat(&self) -> Result<(), BeatError> {
        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        match self.lock.heartbeat(&mut handle) {
            Ok(()) => {}
            Err(LockError::Io { path, source }) => {
                return Err(BeatError::Transient(format!(
                    "lock heartbeat write to {} failed: {source}",
                    path.display()
                )));
            }
            Err(other) => {
                let reason = other.to_string();
                *self.lost.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason.clone());
                return Err(BeatError::Fatal(reason));
            }
        }

        if let Err(e) = self.progress.touch(Utc::now()) {
            warn!(error = %e, "Progress heartbeat failed");
            return Err(BeatError::Transient(e.to_string()));
        }
        Ok(())
    }
}
