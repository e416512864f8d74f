use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::RunContext;
use crate::errors::{PhaseError, StateError};
use crate::layout::RunLayout;
use crate::paragraph::{ParagraphStatus, ReviewOutcome, resolve};
use crate::phase::{AbortSignal, PhaseHandler, PhaseName};
use crate::rework;
use crate::storage;

/// One row of `state/paragraph_scores.jsonl`: the latest review of a paragraph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub paragraph_id: String,
    pub cycle: u32,
    pub attempt: u32,
    pub status: ParagraphStatus,
    pub hard_fail: bool,
    #[serde(default)]
    pub scores: BTreeMap<String, Value>,
    #[serde(default)]
    pub blocking_issues: Vec<String>,
    #[serde(default)]
    pub required_fixes: Vec<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// Latest reviewer fixes per paragraph.
pub(crate) fn latest_fixes(layout: &RunLayout) -> Result<HashMap<String, Vec<String>>, StateError> {
    let rows: Vec<ScoreRow> = storage::read_jsonl(&layout.paragraph_scores())?;
    Ok(rows
        .into_iter()
        .map(|r| (r.paragraph_id, r.required_fixes))
        .collect())
}

/// Apply review outcomes to paragraph state and re-project the rework queue.
pub struct BookkeepingPhase;

#[async_trait]
impl PhaseHandler<RunContext> for BookkeepingPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Bookkeeping
    }

    async fn run(&self, ctx: &RunContext, cycle: u32, _abort: &AbortSignal) -> Result<(), PhaseError> {
        let layout = &ctx.layout;
        let mut book = ctx.load_book()?;
        let pending = book.ids_with_status(ParagraphStatus::ReviewInProgress);

        let mut outcomes: HashMap<String, ReviewOutcome> = if pending.is_empty() {
            HashMap::new()
        } else {
            storage::read_jsonl_required::<ReviewOutcome>(&layout.review_rows())?
                .into_iter()
                .map(|o| (o.paragraph_id.clone(), o))
                .collect()
        };

        let mut scores: BTreeMap<String, ScoreRow> = storage::read_jsonl::<ScoreRow>(&layout.paragraph_scores())?
            .into_iter()
            .map(|r| (r.paragraph_id.clone(), r))
            .collect();

        let now = Utc::now();
        let mut tally: BTreeMap<ParagraphStatus, usize> = BTreeMap::new();
        for id in &pending {
            let outcome = outcomes.remove(id).unwrap_or_else(|| {
                warn!(paragraph_id = %id, "No review row, treating as hard failure");
                ReviewOutcome::missing(id)
            });
            let prior = book.require(id, "bookkeeping")?;
            let resolution = resolve(prior, &outcome, &ctx.policy, now);
            let status = resolution.persisted_status();
            debug!(
                paragraph_id = %id,
                immediate = %resolution.immediate,
                %status,
                attempt = resolution.record.attempt,
                "Review resolved"
            );

            scores.insert(
                id.clone(),
                ScoreRow {
                    paragraph_id: id.clone(),
                    cycle,
                    attempt: resolution.record.attempt,
                    status,
                    hard_fail: outcome.hard_fail,
                    scores: outcome.scores,
                    blocking_issues: resolution.record.blocking_issues.clone(),
                    required_fixes: outcome.required_fixes,
                    reviewed_at: now,
                },
            );
            book.replace(resolution.record)?;
            *tally.entry(status).or_insert(0) += 1;
        }
        for stray in outcomes.keys() {
            debug!(paragraph_id = %stray, "Ignoring review row for paragraph not under review");
        }

        let ordered: Vec<&ScoreRow> = book
            .records()
            .iter()
            .filter_map(|r| scores.get(&r.paragraph_id))
            .collect();
        storage::write_jsonl_atomic(&layout.paragraph_scores(), &ordered)?;
        book.save()?;

        let existing = rework::load_queue(&layout.rework_queue())?;
        let queue = rework::build_queue(&book, &latest_fixes(layout)?, &existing);
        rework::save_queue(&layout.rework_queue(), &queue)?;

        let summary: BTreeMap<&str, usize> = tally.iter().map(|(s, n)| (s.as_str(), *n)).collect();
        info!(resolved = pending.len(), outcome = ?summary, queued = queue.len(), "Bookkeeping done");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::testing::*;
    use super::super::{AssemblePhase, IngestPhase, ReviewPhase, TranslatePhase};
    use super::*;
    use crate::paragraph::review::MISSING_REVIEW_ROW;
    use tempfile::tempdir;

    async fn through_review(ctx: &RunContext) {
        let abort = AbortSignal::new();
        IngestPhase.run(ctx, 0, &abort).await.unwrap();
        TranslatePhase::pass1().run(ctx, 0, &abort).await.unwrap();
        AssemblePhase.run(ctx, 0, &abort).await.unwrap();
        ReviewPhase.run(ctx, 0, &abort).await.unwrap();
    }

    #[tokio::test]
    async fn test_mixed_outcomes_are_routed_and_queued() {
        let dir = tempdir().unwrap();
        // p_0001 passes, p_0002 needs rework, p_0003 has no row.
        let body = r#"cat > "$2" <<'EOF'
{"paragraph_id":"p_0001","hard_fail":false,"scores":{"accuracy":0.95,"fluency":0.9,"terminology":0.9}}
{"paragraph_id":"p_0002","hard_fail":true,"blocking_issues":["typo: a"],"scores":{"accuracy":0.9,"fluency":0.9,"terminology":0.9},"required_fixes":["fix typo"]}
EOF"#;
        let ctx = context(dir.path(), "single-en", tools(dir.path(), body));
        through_review(&ctx).await;

        BookkeepingPhase.run(&ctx, 0, &AbortSignal::new()).await.unwrap();

        let book = ctx.load_book().unwrap();
        assert_eq!(book.get("p_0001").unwrap().status, ParagraphStatus::ReadyToMerge);
        assert_eq!(book.get("p_0002").unwrap().status, ParagraphStatus::ReworkQueued);
        let p3 = book.get("p_0003").unwrap();
        assert_eq!(p3.status, ParagraphStatus::ReworkQueued);
        assert_eq!(p3.blocking_issues[0], MISSING_REVIEW_ROW);

        let queue = rework::load_queue(&ctx.layout.rework_queue()).unwrap();
        let ids: Vec<&str> = queue.iter().map(|p| p.paragraph_id.as_str()).collect();
        assert_eq!(ids, vec!["p_0002", "p_0003"]);
        assert_eq!(queue[0].required_fixes, vec!["fix typo".to_string()]);

        let scores: Vec<ScoreRow> = storage::read_jsonl(&ctx.layout.paragraph_scores()).unwrap();
        assert_eq!(scores.len(), 3);
        assert_eq!(scores[0].status, ParagraphStatus::ReadyToMerge);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), "single-en", tools(dir.path(), REVIEW_FAIL));
        through_review(&ctx).await;

        BookkeepingPhase.run(&ctx, 0, &AbortSignal::new()).await.unwrap();
        let state = std::fs::read(ctx.layout.paragraph_state()).unwrap();
        let queue = std::fs::read(ctx.layout.rework_queue()).unwrap();

        BookkeepingPhase.run(&ctx, 0, &AbortSignal::new()).await.unwrap();
        assert_eq!(std::fs::read(ctx.layout.paragraph_state()).unwrap(), state);
        assert_eq!(std::fs::read(ctx.layout.rework_queue()).unwrap(), queue);
    }
}
