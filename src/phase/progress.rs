//! Advisory progress record (`state/progress.json`).
//!
//! Rewritten at every phase transition and every heartbeat tick. Status
//! reporting reads it; nothing relies on it for correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::PhaseName;
use crate::errors::StateError;
use crate::storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    Running,
    Done,
    Error,
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseState::Pending => "pending",
            PhaseState::Running => "running",
            PhaseState::Done => "done",
            PhaseState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub run_id: String,
    pub pid: u32,
    pub cycle: u32,
    pub current_phase: Option<PhaseName>,
    pub phase_state: PhaseState,
    pub phase_started_at: Option<DateTime<Utc>>,
    pub phase_finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressRecord {
    pub fn load(path: &Path) -> Result<Option<Self>, StateError> {
        storage::read_json(path)
    }
}

/// Shared writer for the progress record.
///
/// The phase sequencer and the heartbeat task both update the record; the
/// mutex keeps their writes from interleaving.
#[derive(Debug)]
pub struct ProgressTracker {
    path: PathBuf,
    record: Mutex<ProgressRecord>,
}

impl ProgressTracker {
    pub fn new(path: PathBuf, run_id: &str, cycle: u32) -> Self {
        Self {
            path,
            record: Mutex::new(ProgressRecord {
                run_id: run_id.to_string(),
                pid: std::process::id(),
                cycle,
                current_phase: None,
                phase_state: PhaseState::Pending,
                phase_started_at: None,
                phase_finished_at: None,
                last_heartbeat_at: None,
                error: None,
            }),
        }
    }

    pub fn snapshot(&self) -> ProgressRecord {
        self.with_record(|r| r.clone())
    }

    pub fn begin(&self, phase: PhaseName, now: DateTime<Utc>) -> Result<(), StateError> {
        self.update(|r| {
            r.current_phase = Some(phase);
            r.phase_state = PhaseState::Running;
            r.phase_started_at = Some(now);
            r.phase_finished_at = None;
            r.error = None;
        })
    }

    pub fn finish(&self, now: DateTime<Utc>) -> Result<(), StateError> {
        self.update(|r| {
            r.phase_state = PhaseState::Done;
            r.phase_finished_at = Some(now);
        })
    }

    pub fn fail(&self, error: &str, now: DateTime<Utc>) -> Result<(), StateError> {
        self.update(|r| {
            r.phase_state = PhaseState::Error;
            r.phase_finished_at = Some(now);
            r.error = Some(error.to_string());
        })
    }

    /// Record a heartbeat tick.
    pub fn touch(&self, now: DateTime<Utc>) -> Result<(), StateError> {
        self.update(|r| r.last_heartbeat_at = Some(now))
    }

    fn update(&self, apply: impl FnOnce(&mut ProgressRecord)) -> Result<(), StateError> {
        let mut guard = self.record.lock().unwrap_or_else(|p| p.into_inner());
        apply(&mut guard);
        storage::write_json_atomic(&self.path, &*guard)
    }

    fn with_record<T>(&self, read: impl FnOnce(&ProgressRecord) -> T) -> T {
        let guard = self.record.lock().unwrap_or_else(|p| p.into_inner());
        read(&guard)
    }
}
