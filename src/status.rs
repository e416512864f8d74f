//! Read-only run status.
//!
//! Collecting a report never takes the run lock and never writes; it is safe
//! to call while another process is running the pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::errors::{LockError, StateError};
use crate::layout::RunLayout;
use crate::lock::{LockInspection, LockSettings, RunLock};
use crate::manifest::Manifest;
use crate::merge::GateReport;
use crate::paragraph::{ParagraphBook, ParagraphStatus};
use crate::phase::{PhaseName, ProgressRecord, marker};
use crate::rework;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Free,
    Fresh,
    Stale,
    Invalid,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub state: LockState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_age_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleStatus {
    pub cycle: u32,
    pub done: Vec<PhaseName>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub cycle: u32,
    pub passed: bool,
    pub evaluated_at: DateTime<Utc>,
    pub blockers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub run_id: String,
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub lock: LockStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressRecord>,
    pub paragraphs: BTreeMap<String, usize>,
    pub total_paragraphs: usize,
    pub excluded_paragraphs: usize,
    pub rework_queue: usize,
    pub cycles: Vec<CycleStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_gate: Option<GateStatus>,
    pub merged_output: bool,
}

fn lock_status(layout: &RunLayout, settings: LockSettings, now: DateTime<Utc>) -> LockStatus {
    let lock = RunLock::new(layout.root(), settings);
    let (state, record, age, detail) = match lock.inspect(now) {
        Ok(None) => (LockState::Free, None, None, None),
        Ok(Some(LockInspection::Fresh { record, age_secs })) => {
            (LockState::Fresh, Some(record), Some(age_secs), None)
        }
        Ok(Some(LockInspection::Stale { record, age_secs })) => {
            (LockState::Stale, Some(record), Some(age_secs), None)
        }
        Err(LockError::Invalid { reason, .. }) => (LockState::Invalid, None, None, Some(reason)),
        Err(e) => (LockState::Invalid, None, None, Some(e.to_string())),
    };
    LockStatus {
        state,
        holder: record.map(|r| r.holder()),
        heartbeat_age_secs: age,
        detail,
    }
}

/// Gather everything known about a run from disk.
pub fn collect(
    layout: &RunLayout,
    run_id: &str,
    lock_settings: LockSettings,
    now: DateTime<Utc>,
) -> Result<StatusReport, StateError> {
    let manifest = Manifest::load(&layout.manifest())?;
    let book = ParagraphBook::load(&layout.paragraph_state())?;
    let mut paragraphs = BTreeMap::new();
    for (status, count) in book.counts() {
        paragraphs.insert(status.as_str().to_string(), count);
    }

    let mut cycles = Vec::new();
    for cycle in layout.cycles() {
        let mut done = Vec::new();
        for phase in PhaseName::ALL {
            if marker::is_done(layout, cycle, phase)? {
                done.push(phase);
            }
        }
        cycles.push(CycleStatus { cycle, done });
    }

    let gate: Option<GateReport> = crate::storage::read_json(&layout.gate_report())?;

    Ok(StatusReport {
        run_id: run_id.to_string(),
        initialized: manifest.is_some(),
        profile: manifest.as_ref().map(|m| m.pipeline_profile.clone()),
        model: manifest.as_ref().map(|m| m.model.clone()),
        lock: lock_status(layout, lock_settings, now),
        progress: ProgressRecord::load(&layout.progress())?,
        paragraphs,
        total_paragraphs: book.len(),
        excluded_paragraphs: book.len() - book.active().count(),
        rework_queue: rework::load_queue(&layout.rework_queue())?.len(),
        cycles,
        merge_gate: gate.map(|g| GateStatus {
            cycle: g.cycle,
            passed: g.passed,
            evaluated_at: g.evaluated_at,
            blockers: g.blocker_summaries(),
        }),
        merged_output: layout.merged().exists(),
    })
}

impl StatusReport {
    /// Plain-text rendering for terminals.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "run:        {}", self.run_id);
        if !self.initialized {
            let _ = writeln!(out, "state:      not initialized");
            return out;
        }
        if let (Some(profile), Some(model)) = (&self.profile, &self.model) {
            let _ = writeln!(out, "profile:    {profile} (model {model})");
        }

        let lock = match (&self.lock.state, &self.lock.holder, self.lock.heartbeat_age_secs) {
            (LockState::Free, ..) => "free".to_string(),
            (LockState::Invalid, ..) => format!(
                "invalid ({})",
                self.lock.detail.as_deref().unwrap_or("unreadable")
            ),
            (state, holder, age) => format!(
                "{} held by {} (heartbeat {}s ago)",
                if *state == LockState::Fresh { "active" } else { "stale" },
                holder.as_deref().unwrap_or("unknown"),
                age.unwrap_or_default()
            ),
        };
        let _ = writeln!(out, "lock:       {lock}");

        if let Some(progress) = &self.progress {
            let phase = progress
                .current_phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "progress:   cycle {} {} {}",
                progress.cycle, phase, progress.phase_state
            );
            if let Some(error) = &progress.error {
                let _ = writeln!(out, "last error: {error}");
            }
        }

        let _ = writeln!(
            out,
            "paragraphs: {} total, {} excluded",
            self.total_paragraphs, self.excluded_paragraphs
        );
        for status in ParagraphStatus::ALL {
            if let Some(count) = self.paragraphs.get(status.as_str()) {
                let _ = writeln!(out, "  {:<24} {count}", status.as_str());
            }
        }
        let _ = writeln!(out, "rework:     {} queued", self.rework_queue);

        for cycle in &self.cycles {
            let done: Vec<&str> = cycle.done.iter().map(|p| p.as_str()).collect();
            let _ = writeln!(out, "cycle {:03}:  {}", cycle.cycle, done.join(", "));
        }

        match &self.merge_gate {
            Some(gate) if gate.passed => {
                let _ = writeln!(out, "merge gate: passed (cycle {})", gate.cycle);
            }
            Some(gate) => {
                let _ = writeln!(
                    out,
                    "merge gate: blocked (cycle {}): {}",
                    gate.cycle,
                    gate.blockers.join(", ")
                );
            }
            None => {
                let _ = writeln!(out, "merge gate: not evaluated");
            }
        }
        out
    }
}
