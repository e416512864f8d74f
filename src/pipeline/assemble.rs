use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{RunContext, clear_artifact};
use crate::config::ToolKind;
use crate::errors::{PhaseError, StateError};
use crate::paragraph::ParagraphStatus;
use crate::phase::{AbortSignal, PhaseHandler, PhaseName};
use crate::storage;
use crate::tools::{TextRow, index_by_id};

/// Build `final/candidate.jsonl` from the current translations.
///
/// Without a configured assemble tool the translations are copied as-is.
pub struct AssemblePhase;

#[async_trait]
impl PhaseHandler<RunContext> for AssemblePhase {
    fn name(&self) -> PhaseName {
        PhaseName::Assemble
    }

    async fn run(&self, ctx: &RunContext, _cycle: u32, abort: &AbortSignal) -> Result<(), PhaseError> {
        let layout = &ctx.layout;
        let mut book = ctx.load_book()?;
        let translations = ctx.load_translations()?;
        for row in &translations {
            book.verify_hash(&row.paragraph_id, &row.content_hash, "translations")?;
        }

        let candidate_path = layout.candidate();
        clear_artifact(&candidate_path)?;
        if ctx.runner.is_configured(ToolKind::Assemble) {
            let vars = ctx.placeholders(
                layout.translations(),
                candidate_path.clone(),
                layout.final_dir(),
                ctx.manifest.profile().target_lang(),
            );
            ctx.runner.run(self.name(), ToolKind::Assemble, &vars, abort).await?;
        } else {
            info!("No assemble tool configured, using translations as candidate");
            storage::write_jsonl_atomic(&candidate_path, &translations)?;
        }

        let candidate: Vec<TextRow> = storage::read_jsonl_required(&candidate_path)?;
        let index = index_by_id(&candidate, |r| r.paragraph_id.as_str(), &candidate_path)?;
        for row in &candidate {
            book.verify_hash(&row.paragraph_id, &row.content_hash, "assemble")?;
        }
        for row in &translations {
            if !index.contains_key(row.paragraph_id.as_str()) {
                return Err(StateError::MissingParagraph {
                    paragraph_id: row.paragraph_id.clone(),
                    context: candidate_path.display().to_string(),
                }
                .into());
            }
        }

        let now = Utc::now();
        let ready: Vec<String> = book
            .active()
            .filter(|r| {
                matches!(
                    r.status,
                    ParagraphStatus::TranslatedPass1 | ParagraphStatus::TranslatedPass2
                )
            })
            .map(|r| r.paragraph_id.clone())
            .collect();
        for id in &ready {
            if !index.contains_key(id.as_str()) {
                return Err(StateError::MissingParagraph {
                    paragraph_id: id.clone(),
                    context: candidate_path.display().to_string(),
                }
                .into());
            }
            book.transition(id, ParagraphStatus::CandidateAssembled, now)?;
        }
        book.save()?;

        info!(rows = candidate.len(), assembled = ready.len(), "Candidate assembled");
        Ok(())
    }
}
