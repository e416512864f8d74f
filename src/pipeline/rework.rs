use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::bookkeeping::latest_fixes;
use super::{RunContext, clear_artifact};
use crate::config::ToolKind;
use crate::errors::{PhaseError, StateError};
use crate::paragraph::ParagraphStatus;
use crate::phase::{AbortSignal, PhaseHandler, PhaseName};
use crate::rework::{self, ReworkPacket};
use crate::storage;
use crate::tools::{ReworkRequest, TextRow, verify_returned_set};

/// Send queued paragraphs to the rework tool and route them back into the pipeline.
pub struct ReworkPhase;

#[async_trait]
impl PhaseHandler<RunContext> for ReworkPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Rework
    }

    async fn run(&self, ctx: &RunContext, cycle: u32, abort: &AbortSignal) -> Result<(), PhaseError> {
        let layout = &ctx.layout;
        let mut book = ctx.load_book()?;
        let queue = rework::load_queue(&layout.rework_queue())?;
        rework::verify_lineage(&queue, &book)?;

        // A crash after the book was saved leaves already-routed packets behind.
        let packets: Vec<&Arc<ReworkPacket>> = queue
            .iter()
            .filter(|p| {
                let queued = book
                    .get(&p.paragraph_id)
                    .is_some_and(|r| r.status == ParagraphStatus::ReworkQueued);
                if !queued {
                    warn!(paragraph_id = %p.paragraph_id, "Skipping packet no longer queued");
                }
                queued
            })
            .collect();
        if packets.is_empty() {
            info!("Rework queue empty");
            return Ok(());
        }

        let sources: BTreeMap<String, String> = ctx
            .load_sources()?
            .into_iter()
            .map(|s| (s.paragraph_id, s.text))
            .collect();
        let translations = ctx.load_translations()?;
        let current: BTreeMap<&str, &str> = translations
            .iter()
            .map(|t| (t.paragraph_id.as_str(), t.text.as_str()))
            .collect();

        let mut requests = Vec::with_capacity(packets.len());
        for packet in &packets {
            let id = packet.paragraph_id.as_str();
            let source_text = sources.get(id).ok_or_else(|| StateError::MissingParagraph {
                paragraph_id: id.to_string(),
                context: layout.ingest_output().display().to_string(),
            })?;
            requests.push(ReworkRequest {
                paragraph_id: id.to_string(),
                content_hash: packet.content_hash.clone(),
                source_text: source_text.clone(),
                current_text: current.get(id).copied().unwrap_or_default().to_string(),
                attempt: packet.attempt,
                failure_reasons: packet.failure_reasons.clone(),
                required_fixes: packet.required_fixes.clone(),
            });
        }

        let workdir = layout.rework_dir(cycle);
        let input_path = workdir.join("input.jsonl");
        let output_path = workdir.join("output.jsonl");
        storage::write_jsonl_atomic(&input_path, &requests)?;
        clear_artifact(&output_path)?;

        let vars = ctx.placeholders(
            input_path,
            output_path.clone(),
            workdir,
            ctx.manifest.profile().target_lang(),
        );
        ctx.runner.run(self.name(), ToolKind::Rework, &vars, abort).await?;

        let returned: Vec<TextRow> = storage::read_jsonl_required(&output_path)?;
        let submitted: Vec<&str> = packets.iter().map(|p| p.paragraph_id.as_str()).collect();
        verify_returned_set(&submitted, &returned, &output_path)?;
        for row in &returned {
            book.verify_hash(&row.paragraph_id, &row.content_hash, "rework")?;
        }

        ctx.store_translations(&book, translations, returned)?;
        let reentry = ctx.manifest.rework_reentry.target();
        let now = Utc::now();
        for id in &submitted {
            book.transition(id, ParagraphStatus::Reworked, now)?;
            book.transition(id, reentry, now)?;
        }
        book.save()?;

        let requeued = rework::build_queue(&book, &latest_fixes(layout)?, &queue);
        rework::save_queue(&layout.rework_queue(), &requeued)?;

        info!(reworked = submitted.len(), %reentry, "Rework done");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::testing::*;
    use super::super::{AssemblePhase, BookkeepingPhase, IngestPhase, ReviewPhase, TranslatePhase};
    use super::*;
    use tempfile::tempdir;

    async fn through_bookkeeping(ctx: &RunContext) {
        let abort = AbortSignal::new();
        IngestPhase.run(ctx, 0, &abort).await.unwrap();
        TranslatePhase::pass1().run(ctx, 0, &abort).await.unwrap();
        AssemblePhase.run(ctx, 0, &abort).await.unwrap();
        ReviewPhase.run(ctx, 0, &abort).await.unwrap();
        BookkeepingPhase.run(ctx, 0, &abort).await.unwrap();
    }

    #[tokio::test]
    async fn test_rework_reenters_at_review_for_polish_profile() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), "polish-en", tools(dir.path(), REVIEW_FAIL));
        through_bookkeeping(&ctx).await;

        ReworkPhase.run(&ctx, 1, &AbortSignal::new()).await.unwrap();

        let book = ctx.load_book().unwrap();
        assert_eq!(book.ids_with_status(ParagraphStatus::ReviewInProgress).len(), 3);
        assert!(rework::load_queue(&ctx.layout.rework_queue()).unwrap().is_empty());
        let translations = ctx.load_translations().unwrap();
        assert_eq!(translations[0].text, "reworked p_0001");

        let requests: Vec<ReworkRequest> =
            storage::read_jsonl(&ctx.layout.rework_dir(1).join("input.jsonl")).unwrap();
        assert_eq!(requests[0].source_text, "One.");
        assert_eq!(requests[0].current_text, "[en] One.");
        assert_eq!(requests[0].failure_reasons, vec!["typo: fix spelling".to_string()]);
    }

    #[tokio::test]
    async fn test_rework_rejects_queue_with_foreign_hash() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), "single-en", tools(dir.path(), REVIEW_FAIL));
        through_bookkeeping(&ctx).await;

        let mut queue = rework::load_queue(&ctx.layout.rework_queue()).unwrap();
        let mut tampered = (*queue[0]).clone();
        tampered.content_hash = "deadbeef".into();
        queue[0] = Arc::new(tampered);
        rework::save_queue(&ctx.layout.rework_queue(), &queue).unwrap();

        let err = ReworkPhase.run(&ctx, 1, &AbortSignal::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PhaseError::State(StateError::LineageMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), "single-en", tools(dir.path(), REVIEW_PASS));
        through_bookkeeping(&ctx).await;

        ReworkPhase.run(&ctx, 1, &AbortSignal::new()).await.unwrap();
        assert!(!ctx.layout.rework_dir(1).exists());
    }
}
