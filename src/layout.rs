//! On-disk layout of a run directory.
//!
//! ```text
//! <runs>/<run_id>/
//!   run.lock  locks/  manifest.json
//!   state/  ingest/  translate_pass1/  translate_pass2/  review/  rework/
//!   final/  logs/
//! ```

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::errors::UsageError;
use crate::lock::LOCK_FILE_NAME;
use crate::phase::PhaseName;

static RUN_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").unwrap());

/// Reject run ids that could escape the runs root or collide with layout names.
pub fn validate_run_id(run_id: &str) -> Result<(), UsageError> {
    if RUN_ID_REGEX.is_match(run_id) {
        Ok(())
    } else {
        Err(UsageError::InvalidRunId(run_id.to_string()))
    }
}

/// Paths of one run directory.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(runs_root: &Path, run_id: &str) -> Self {
        Self {
            root: runs_root.join(run_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE_NAME)
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn paragraph_state(&self) -> PathBuf {
        self.state_dir().join("paragraph_state.jsonl")
    }

    pub fn translations(&self) -> PathBuf {
        self.state_dir().join("translations.jsonl")
    }

    pub fn rework_queue(&self) -> PathBuf {
        self.state_dir().join("rework_queue.jsonl")
    }

    pub fn paragraph_scores(&self) -> PathBuf {
        self.state_dir().join("paragraph_scores.jsonl")
    }

    pub fn run_blockers(&self) -> PathBuf {
        self.state_dir().join("run_blockers.json")
    }

    pub fn progress(&self) -> PathBuf {
        self.state_dir().join("progress.json")
    }

    pub fn phases_dir(&self) -> PathBuf {
        self.state_dir().join("phases")
    }

    pub fn cycle_dir(&self, cycle: u32) -> PathBuf {
        self.phases_dir().join(cycle_name(cycle))
    }

    pub fn phase_marker(&self, cycle: u32, phase: PhaseName) -> PathBuf {
        self.cycle_dir(cycle).join(format!("{}.json", phase.as_str()))
    }

    pub fn ingest_dir(&self) -> PathBuf {
        self.root.join("ingest")
    }

    pub fn ingest_output(&self) -> PathBuf {
        self.ingest_dir().join("paragraphs.jsonl")
    }

    pub fn translate_dir(&self, pass: u8) -> PathBuf {
        self.root.join(format!("translate_pass{pass}"))
    }

    pub fn review_dir(&self) -> PathBuf {
        self.root.join("review")
    }

    pub fn review_rows(&self) -> PathBuf {
        self.review_dir().join("review_rows.jsonl")
    }

    pub fn review_report(&self) -> PathBuf {
        self.review_dir().join("review_report.json")
    }

    pub fn rework_dir(&self, cycle: u32) -> PathBuf {
        self.root.join("rework").join(cycle_name(cycle))
    }

    pub fn final_dir(&self) -> PathBuf {
        self.root.join("final")
    }

    pub fn candidate(&self) -> PathBuf {
        self.final_dir().join("candidate.jsonl")
    }

    pub fn gate_report(&self) -> PathBuf {
        self.final_dir().join("merge_gate_report.json")
    }

    pub fn merged(&self) -> PathBuf {
        self.final_dir().join("merged.md")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Cycle numbers that have a marker directory, ascending.
    pub fn cycles(&self) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir(self.phases_dir()) else {
            return Vec::new();
        };
        let mut cycles: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix("cycle-"))
                    .and_then(|n| n.parse().ok())
            })
            .collect();
        cycles.sort_unstable();
        cycles
    }
}

fn cycle_name(cycle: u32) -> String {
    format!("cycle-{cycle:03}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_run_id_pattern() {
        let longest = "x".repeat(64);
        let too_long = "x".repeat(65);
        for ok in ["run1", "A", "book-2026.v2_final", longest.as_str()] {
            assert!(validate_run_id(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["", "-lead", ".hidden", "../escape", "a/b", "sp ace", too_long.as_str()] {
            assert!(validate_run_id(bad).is_err(), "{bad} should be invalid");
        }
    }

    #[test]
    fn test_marker_paths_are_cycle_scoped() {
        let layout = RunLayout::new(Path::new("/runs"), "r1");
        assert_eq!(
            layout.phase_marker(3, PhaseName::Review),
            PathBuf::from("/runs/r1/state/phases/cycle-003/review.json")
        );
        assert_eq!(
            layout.rework_dir(12),
            PathBuf::from("/runs/r1/rework/cycle-012")
        );
    }

    #[test]
    fn test_cycles_lists_marker_dirs_in_order() {
        let dir = tempdir().unwrap();
        let layout = RunLayout::new(dir.path(), "r1");
        assert!(layout.cycles().is_empty());
        for c in [2, 0, 10] {
            std::fs::create_dir_all(layout.cycle_dir(c)).unwrap();
        }
        std::fs::create_dir_all(layout.phases_dir().join("junk")).unwrap();
        assert_eq!(layout.cycles(), vec![0, 2, 10]);
    }
}
