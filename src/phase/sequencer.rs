//! Sequential, resumable phase execution.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

use super::{AbortSignal, CyclePlan, PhaseName, ProgressTracker, marker};
use crate::errors::PhaseError;
use crate::layout::RunLayout;

/// One phase of the pipeline.
///
/// `C` is the run context shared by all handlers.
#[async_trait]
pub trait PhaseHandler<C: Sync>: Send + Sync {
    fn name(&self) -> PhaseName;

    async fn run(&self, ctx: &C, cycle: u32, abort: &AbortSignal) -> Result<(), PhaseError>;
}

/// What happened to each phase of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u32,
    pub completed: Vec<PhaseName>,
    pub skipped: Vec<PhaseName>,
}

pub struct Sequencer<'a> {
    layout: &'a RunLayout,
    progress: Arc<ProgressTracker>,
    abort: AbortSignal,
}

impl<'a> Sequencer<'a> {
    pub fn new(layout: &'a RunLayout, progress: Arc<ProgressTracker>, abort: AbortSignal) -> Self {
        Self {
            layout,
            progress,
            abort,
        }
    }

    /// Run every phase of `plan` in order.
    ///
    /// Phases with a completion marker are skipped. The first failure stops
    /// the cycle; later phases are left pending.
    pub async fn run_cycle<C: Sync>(
        &self,
        plan: &CyclePlan,
        handlers: &[Box<dyn PhaseHandler<C>>],
        ctx: &C,
    ) -> Result<CycleReport, PhaseError> {
        let mut report = CycleReport {
            cycle: plan.cycle,
            ..Default::default()
        };

        for &phase in &plan.phases {
            let handler = handlers
                .iter()
                .find(|h| h.name() == phase)
                .ok_or_else(|| PhaseError::Aborted {
                    phase: phase.to_string(),
                    reason: "no handler registered".to_string(),
                })?;

            if marker::is_done(self.layout, plan.cycle, phase)? {
                info!(%phase, cycle = plan.cycle, "Phase already done, skipping");
                report.skipped.push(phase);
                continue;
            }

            self.abort.check(phase)?;

            let started_at = Utc::now();
            self.progress.begin(phase, started_at)?;
            info!(%phase, cycle = plan.cycle, "Phase started");

            let result = handler
                .run(ctx, plan.cycle, &self.abort)
                .await
                .and_then(|()| self.abort.check(phase));

            match result {
                Ok(()) => {
                    let finished_at = Utc::now();
                    self.progress.finish(finished_at)?;
                    marker::write_done(self.layout, plan.cycle, phase, started_at, finished_at)?;
                    info!(
                        %phase,
                        cycle = plan.cycle,
                        elapsed_ms = (finished_at - started_at).num_milliseconds(),
                        "Phase done"
                    );
                    report.completed.push(phase);
                }
                Err(e) => {
                    error!(%phase, cycle = plan.cycle, error = %e, "Phase failed");
                    if let Err(write_err) = self.progress.fail(&e.to_string(), Utc::now()) {
                        error!(error = %write_err, "Could not record phase failure");
                    }
                    return Err(e);
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseState;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Journal {
        ran: Mutex<Vec<PhaseName>>,
    }

    struct Step {
        phase: PhaseName,
        fail: bool,
    }

    #[async_trait]
    impl PhaseHandler<Journal> for Step {
        fn name(&self) -> PhaseName {
            self.phase
        }

        async fn run(&self, ctx: &Journal, _cycle: u32, _abort: &AbortSignal) -> Result<(), PhaseError> {
            ctx.ran.lock().unwrap().push(self.phase);
            if self.fail {
                return Err(PhaseError::ToolFailed {
                    phase: self.phase.to_string(),
                    tool: "stub".into(),
                    exit_code: 9,
                });
            }
            Ok(())
        }
    }

    fn handlers(failing: Option<PhaseName>) -> Vec<Box<dyn PhaseHandler<Journal>>> {
        CyclePlan::full(false)
            .phases
            .into_iter()
            .map(|phase| {
                Box::new(Step {
                    phase,
                    fail: Some(phase) == failing,
                }) as Box<dyn PhaseHandler<Journal>>
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failure_stops_cycle_and_rerun_resumes() {
        let dir = tempdir().unwrap();
        let layout = RunLayout::new(dir.path(), "r1");
        let progress = Arc::new(ProgressTracker::new(layout.progress(), "r1", 0));
        let sequencer = Sequencer::new(&layout, progress.clone(), AbortSignal::new());
        let plan = CyclePlan::full(false);

        let journal = Journal::default();
        let err = sequencer
            .run_cycle(&plan, &handlers(Some(PhaseName::Review)), &journal)
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseError::ToolFailed { .. }));
        assert_eq!(
            *journal.ran.lock().unwrap(),
            vec![
                PhaseName::Ingest,
                PhaseName::TranslatePass1,
                PhaseName::Assemble,
                PhaseName::Review
            ]
        );
        assert!(!marker::is_done(&layout, 0, PhaseName::Review).unwrap());
        assert_eq!(progress.snapshot().phase_state, PhaseState::Error);

        let journal = Journal::default();
        let report = sequencer
            .run_cycle(&plan, &handlers(None), &journal)
            .await
            .unwrap();
        assert_eq!(
            report.skipped,
            vec![PhaseName::Ingest, PhaseName::TranslatePass1, PhaseName::Assemble]
        );
        assert_eq!(
            report.completed,
            vec![PhaseName::Review, PhaseName::Bookkeeping, PhaseName::Merge]
        );
    }

    #[tokio::test]
    async fn test_fired_abort_prevents_next_phase() {
        let dir = tempdir().unwrap();
        let layout = RunLayout::new(dir.path(), "r1");
        let progress = Arc::new(ProgressTracker::new(layout.progress(), "r1", 0));
        let abort = AbortSignal::new();
        abort.trigger("heartbeat degraded");
        let sequencer = Sequencer::new(&layout, progress, abort);

        let journal = Journal::default();
        let err = sequencer
            .run_cycle(&CyclePlan::full(false), &handlers(None), &journal)
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseError::Aborted { .. }));
        assert!(journal.ran.lock().unwrap().is_empty());
    }
}
