use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

use super::{RunContext, clear_artifact};
use crate::config::ToolKind;
use crate::errors::{PhaseError, StateError};
use crate::layout::RunLayout;
use crate::paragraph::{ParagraphStatus, ReviewOutcome};
use crate::phase::{AbortSignal, PhaseHandler, PhaseName};
use crate::storage;
use crate::tools::{ReviewReport, TextRow, index_by_id};

/// `state/run_blockers.json`: run-level issues from the latest review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBlockers {
    pub cycle: u32,
    pub blockers: Vec<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Submit assembled paragraphs to the review tool and validate its rows.
///
/// Outcomes are applied by the bookkeeping phase; this phase only moves
/// paragraphs into `review_in_progress` and records what the reviewer said.
pub struct ReviewPhase;

#[async_trait]
impl PhaseHandler<RunContext> for ReviewPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Review
    }

    async fn run(&self, ctx: &RunContext, cycle: u32, abort: &AbortSignal) -> Result<(), PhaseError> {
        let layout = &ctx.layout;
        let mut book = ctx.load_book()?;
        let now = Utc::now();
        for id in book.ids_with_status(ParagraphStatus::CandidateAssembled) {
            book.transition(&id, ParagraphStatus::ReviewInProgress, now)?;
        }
        book.save()?;

        let under_review: BTreeSet<String> = book
            .active()
            .filter(|r| r.status == ParagraphStatus::ReviewInProgress)
            .map(|r| r.paragraph_id.clone())
            .collect();
        if under_review.is_empty() {
            let previous: Option<RunBlockers> = storage::read_json(&layout.run_blockers())?;
            if let Some(previous) = previous.filter(|p| p.cycle != cycle && !p.blockers.is_empty()) {
                info!(
                    from_cycle = previous.cycle,
                    blockers = ?previous.blockers,
                    "Dropping run blockers not re-reported this cycle"
                );
            }
            record_run_blockers(layout, cycle, Vec::new())?;
            info!("Nothing to review");
            return Ok(());
        }

        let candidate_path = layout.candidate();
        let candidate: Vec<TextRow> = storage::read_jsonl_required(&candidate_path)?;
        let input: Vec<&TextRow> = candidate
            .iter()
            .filter(|r| under_review.contains(&r.paragraph_id))
            .collect();
        if let Some(missing) = under_review
            .iter()
            .find(|id| !input.iter().any(|r| &r.paragraph_id == *id))
        {
            return Err(StateError::MissingParagraph {
                paragraph_id: missing.clone(),
                context: candidate_path.display().to_string(),
            }
            .into());
        }

        let workdir = layout.review_dir();
        let input_path = workdir.join("input.jsonl");
        let rows_path = layout.review_rows();
        storage::write_jsonl_atomic(&input_path, &input)?;
        clear_artifact(&rows_path)?;
        clear_artifact(&layout.review_report())?;

        let vars = ctx.placeholders(
            input_path,
            rows_path.clone(),
            workdir,
            ctx.manifest.profile().target_lang(),
        );
        ctx.runner.run(self.name(), ToolKind::Review, &vars, abort).await?;

        let rows: Vec<ReviewOutcome> = storage::read_jsonl_required(&rows_path)?;
        index_by_id(&rows, |r| r.paragraph_id.as_str(), &rows_path)?;
        for row in &rows {
            if !under_review.contains(&row.paragraph_id) {
                return Err(StateError::UnknownParagraph {
                    paragraph_id: row.paragraph_id.clone(),
                    context: rows_path.display().to_string(),
                }
                .into());
            }
        }
        let missing = under_review.len() - rows.len();
        if missing > 0 {
            warn!(missing, "Review tool omitted paragraphs; they will hard-fail");
        }

        let report: ReviewReport = storage::read_json(&layout.review_report())?.unwrap_or_default();
        if !report.run_blockers.is_empty() {
            warn!(blockers = ?report.run_blockers, "Review reported run-level blockers");
        }
        record_run_blockers(layout, cycle, report.run_blockers)?;

        info!(reviewed = rows.len(), "Review done");
        Ok(())
    }
}

fn record_run_blockers(layout: &RunLayout, cycle: u32, blockers: Vec<String>) -> Result<(), StateError> {
    storage::write_json_atomic(
        &layout.run_blockers(),
        &RunBlockers {
            cycle,
            blockers,
            recorded_at: Some(Utc::now()),
        },
    )
}
