use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{RunContext, clear_artifact};
use crate::config::ToolKind;
use crate::errors::{PhaseError, StateError};
use crate::paragraph::{SeedRow, content_hash};
use crate::phase::{AbortSignal, PhaseHandler, PhaseName};
use crate::storage;
use crate::tools::SourceParagraph;

/// Split the source into paragraphs and seed (or re-verify) paragraph state.
pub struct IngestPhase;

#[async_trait]
impl PhaseHandler<RunContext> for IngestPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Ingest
    }

    async fn run(&self, ctx: &RunContext, _cycle: u32, abort: &AbortSignal) -> Result<(), PhaseError> {
        let layout = &ctx.layout;
        let output = layout.ingest_output();
        clear_artifact(&output)?;

        let vars = ctx.placeholders(
            ctx.manifest.source_path.clone(),
            output.clone(),
            layout.ingest_dir(),
            &ctx.manifest.source_lang,
        );
        ctx.runner.run(self.name(), ToolKind::Ingest, &vars, abort).await?;

        let sources: Vec<SourceParagraph> = storage::read_jsonl_required(&output)?;
        if sources.is_empty() {
            return Err(StateError::Corrupt {
                path: output,
                line: 0,
                reason: "ingest produced no paragraphs".to_string(),
            }
            .into());
        }

        let rows: Vec<SeedRow> = sources
            .iter()
            .map(|s| SeedRow {
                paragraph_id: s.paragraph_id.clone(),
                content_hash: content_hash(&s.text),
                excluded: ctx.exclusion.is_excluded(&s.paragraph_id),
            })
            .collect();
        let excluded = rows.iter().filter(|r| r.excluded).count();

        let mut book = ctx.load_book()?;
        let fresh = book.is_empty();
        book.seed(&rows, &output, Utc::now())?;
        book.save()?;

        info!(paragraphs = rows.len(), excluded, fresh, "Source ingested");
        Ok(())
    }
}
