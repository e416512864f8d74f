//! Phase completion markers (`state/phases/cycle-NNN/<phase>.json`).
//!
//! A marker is written only after the phase succeeded and the progress
//! record was updated. Its presence is what makes a phase skippable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PhaseName, PhaseState};
use crate::errors::StateError;
use crate::layout::RunLayout;
use crate::storage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMarker {
    pub phase: PhaseName,
    pub cycle: u32,
    pub state: PhaseState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub fn read(layout: &RunLayout, cycle: u32, phase: PhaseName) -> Result<Option<PhaseMarker>, StateError> {
    let path = layout.phase_marker(cycle, phase);
    let marker: Option<PhaseMarker> = storage::read_json(&path)?;
    match marker {
        Some(m) if m.phase != phase || m.cycle != cycle => Err(StateError::Corrupt {
            path,
            line: 0,
            reason: format!(
                "marker records {} cycle {}, expected {} cycle {}",
                m.phase, m.cycle, phase, cycle
            ),
        }),
        other => Ok(other),
    }
}

pub fn is_done(layout: &RunLayout, cycle: u32, phase: PhaseName) -> Result<bool, StateError> {
    Ok(read(layout, cycle, phase)?.is_some_and(|m| m.state == PhaseState::Done))
}

pub fn write_done(
    layout: &RunLayout,
    cycle: u32,
    phase: PhaseName,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> Result<(), StateError> {
    let marker = PhaseMarker {
        phase,
        cycle,
        state: PhaseState::Done,
        started_at,
        finished_at,
    };
    storage::write_json_atomic(&layout.phase_marker(cycle, phase), &marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_marker_roundtrip_and_scope() {
        let dir = tempdir().unwrap();
        let layout = RunLayout::new(dir.path(), "r1");
        assert!(!is_done(&layout, 0, PhaseName::Ingest).unwrap());

        let now = Utc::now();
        write_done(&layout, 0, PhaseName::Ingest, now, now).unwrap();
        assert!(is_done(&layout, 0, PhaseName::Ingest).unwrap());
        assert!(!is_done(&layout, 1, PhaseName::Ingest).unwrap());
        assert!(!is_done(&layout, 0, PhaseName::TranslatePass1).unwrap());
    }

    #[test]
    fn test_misplaced_marker_is_corrupt() {
        let dir = tempdir().unwrap();
        let layout = RunLayout::new(dir.path(), "r1");
        let now = Utc::now();
        write_done(&layout, 0, PhaseName::Ingest, now, now).unwrap();
        std::fs::copy(
            layout.phase_marker(0, PhaseName::Ingest),
            layout.phase_marker(0, PhaseName::Review),
        )
        .unwrap();

        assert!(matches!(
            is_done(&layout, 0, PhaseName::Review),
            Err(StateError::Corrupt { .. })
        ));
    }
}
