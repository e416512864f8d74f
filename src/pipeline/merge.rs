use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{RunBlockers, RunContext};
use crate::errors::PhaseError;
use crate::merge::{GateInputs, evaluate, render_merged};
use crate::paragraph::ParagraphStatus;
use crate::phase::{AbortSignal, PhaseHandler, PhaseName};
use crate::storage;
use crate::tools::TextRow;

/// Evaluate the merge gate and, only if it passes, write `final/merged.md`.
pub struct MergePhase;

#[async_trait]
impl PhaseHandler<RunContext> for MergePhase {
    fn name(&self) -> PhaseName {
        PhaseName::Merge
    }

    async fn run(&self, ctx: &RunContext, cycle: u32, _abort: &AbortSignal) -> Result<(), PhaseError> {
        let layout = &ctx.layout;
        let mut book = ctx.load_book()?;
        let sources = ctx.load_sources()?;
        let candidate: Vec<TextRow> = storage::read_jsonl(&layout.candidate())?;
        let run_blockers: RunBlockers = storage::read_json(&layout.run_blockers())?.unwrap_or_default();
        // Only the review of this cycle speaks for the current candidate.
        let current_blockers: &[String] = if run_blockers.cycle == cycle {
            &run_blockers.blockers
        } else {
            debug!(recorded_cycle = run_blockers.cycle, cycle, "Ignoring run blockers from an earlier cycle");
            &[]
        };

        let report = evaluate(
            &GateInputs {
                run_id: &ctx.manifest.run_id,
                cycle,
                book: &book,
                sources: &sources,
                translations: &candidate,
                run_blockers: current_blockers,
            },
            Utc::now(),
        );
        storage::write_json_atomic(&layout.gate_report(), &report)?;

        if !report.passed {
            warn!(blockers = report.blockers.len(), "Merge gate blocked");
            return Err(PhaseError::MergeBlocked {
                blockers: report.blocker_summaries(),
            });
        }

        let merged = render_merged(&book, &sources, &candidate);
        storage::write_bytes_atomic(&layout.merged(), merged.as_bytes())?;

        let now = Utc::now();
        for id in book.ids_with_status(ParagraphStatus::ReadyToMerge) {
            book.transition(&id, ParagraphStatus::Merged, now)?;
        }
        book.save()?;

        info!(
            paragraphs = report.required_paragraphs,
            excluded = report.excluded_paragraphs,
            path = %layout.merged().display(),
            "Merged output written"
        );
        Ok(())
    }
}
