//! Phase sequencing.
//!
//! - [`PhaseName`] / [`CyclePlan`]: which phases run, in which order
//! - [`marker`]: on-disk completion markers that make phases resumable
//! - [`progress`]: the advisory progress record
//! - [`heartbeat`]: the background lock heartbeat and the abort signal
//! - [`sequencer`]: runs a plan, skipping completed phases

pub mod heartbeat;
pub mod marker;
pub mod progress;
pub mod sequencer;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use heartbeat::{AbortSignal, BeatError, Heartbeat, HeartbeatSettings, HeartbeatSupervisor};
pub use progress::{PhaseState, ProgressRecord, ProgressTracker};
pub use sequencer::{CycleReport, PhaseHandler, Sequencer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Ingest,
    TranslatePass1,
    TranslatePass2,
    Assemble,
    Review,
    Bookkeeping,
    Merge,
    Rework,
}

impl PhaseName {
    pub const ALL: [PhaseName; 8] = [
        PhaseName::Ingest,
        PhaseName::TranslatePass1,
        PhaseName::TranslatePass2,
        PhaseName::Assemble,
        PhaseName::Review,
        PhaseName::Bookkeeping,
        PhaseName::Merge,
        PhaseName::Rework,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Ingest => "ingest",
            PhaseName::TranslatePass1 => "translate_pass1",
            PhaseName::TranslatePass2 => "translate_pass2",
            PhaseName::Assemble => "assemble",
            PhaseName::Review => "review",
            PhaseName::Bookkeeping => "bookkeeping",
            PhaseName::Merge => "merge",
            PhaseName::Rework => "rework",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered phases of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePlan {
    pub cycle: u32,
    pub phases: Vec<PhaseName>,
}

impl CyclePlan {
    /// Cycle 0: the initial full pass over the document.
    pub fn full(has_pass2: bool) -> Self {
        let mut phases = vec![PhaseName::Ingest, PhaseName::TranslatePass1];
        if has_pass2 {
            phases.push(PhaseName::TranslatePass2);
        }
        phases.extend([
            PhaseName::Assemble,
            PhaseName::Review,
            PhaseName::Bookkeeping,
            PhaseName::Merge,
        ]);
        Self { cycle: 0, phases }
    }

    /// A targeted rework cycle (`cycle >= 1`).
    pub fn rework(cycle: u32) -> Self {
        Self {
            cycle,
            phases: vec![
                PhaseName::Rework,
                PhaseName::Assemble,
                PhaseName::Review,
                PhaseName::Bookkeeping,
                PhaseName::Merge,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_plan_order() {
        let plan = CyclePlan::full(true);
        assert_eq!(plan.cycle, 0);
        assert_eq!(
            plan.phases,
            vec![
                PhaseName::Ingest,
                PhaseName::TranslatePass1,
                PhaseName::TranslatePass2,
                PhaseName::Assemble,
                PhaseName::Review,
                PhaseName::Bookkeeping,
                PhaseName::Merge,
            ]
        );
        assert!(!CyclePlan::full(false).phases.contains(&PhaseName::TranslatePass2));
    }

    #[test]
    fn test_rework_plan_starts_with_rework() {
        let plan = CyclePlan::rework(2);
        assert_eq!(plan.cycle, 2);
        assert_eq!(plan.phases.first(), Some(&PhaseName::Rework));
        assert_eq!(plan.phases.last(), Some(&PhaseName::Merge));
    }

    #[test]
    fn test_phase_names_serialize_like_display() {
        let json = serde_json::to_string(&PhaseName::TranslatePass1).unwrap();
        assert_eq!(json, "\"translate_pass1\"");
    }
}
