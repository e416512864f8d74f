use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{RunContext, clear_artifact};
use crate::config::ToolKind;
use crate::errors::{PhaseError, StateError};
use crate::paragraph::ParagraphStatus;
use crate::phase::{AbortSignal, PhaseHandler, PhaseName};
use crate::storage;
use crate::tools::{TextRow, verify_returned_set};

/// One translation pass.
///
/// Pass 1 translates source text into `pass1_lang`; pass 2 translates the
/// pass-1 text into `pass2_lang`. Only paragraphs sitting in the pass's
/// entry status are submitted, so a rerun picks up where a crash left off.
pub struct TranslatePhase {
    pass: u8,
}

impl TranslatePhase {
    pub fn pass1() -> Self {
        Self { pass: 1 }
    }

    pub fn pass2() -> Self {
        Self { pass: 2 }
    }

    fn statuses(&self) -> (ParagraphStatus, ParagraphStatus) {
        if self.pass == 1 {
            (ParagraphStatus::Ingested, ParagraphStatus::TranslatedPass1)
        } else {
            (ParagraphStatus::TranslatedPass1, ParagraphStatus::TranslatedPass2)
        }
    }
}

#[async_trait]
impl PhaseHandler<RunContext> for TranslatePhase {
    fn name(&self) -> PhaseName {
        if self.pass == 1 {
            PhaseName::TranslatePass1
        } else {
            PhaseName::TranslatePass2
        }
    }

    async fn run(&self, ctx: &RunContext, _cycle: u32, abort: &AbortSignal) -> Result<(), PhaseError> {
        let phase = self.name();
        let lang = if self.pass == 1 {
            ctx.manifest.pass1_lang.clone()
        } else {
            match &ctx.manifest.pass2_lang {
                Some(lang) => lang.clone(),
                None => {
                    debug!("Profile has no second pass");
                    return Ok(());
                }
            }
        };
        let (from, to) = self.statuses();

        let mut book = ctx.load_book()?;
        let pending: Vec<String> = book
            .active()
            .filter(|r| r.status == from)
            .map(|r| r.paragraph_id.clone())
            .collect();
        if pending.is_empty() {
            info!(%phase, "Nothing to translate");
            return Ok(());
        }

        let translations = ctx.load_translations()?;
        let texts: BTreeMap<String, String> = if self.pass == 1 {
            ctx.load_sources()?
                .into_iter()
                .map(|s| (s.paragraph_id, s.text))
                .collect()
        } else {
            translations
                .iter()
                .map(|t| (t.paragraph_id.clone(), t.text.clone()))
                .collect()
        };

        let mut input = Vec::with_capacity(pending.len());
        for id in &pending {
            let text = texts.get(id).ok_or_else(|| StateError::MissingParagraph {
                paragraph_id: id.clone(),
                context: format!("{phase} input"),
            })?;
            let record = book.require(id, phase.as_str())?;
            input.push(TextRow {
                paragraph_id: id.clone(),
                content_hash: record.content_hash.clone(),
                text: text.clone(),
            });
        }

        let workdir = ctx.layout.translate_dir(self.pass);
        let input_path = workdir.join("input.jsonl");
        let output_path = workdir.join("output.jsonl");
        storage::write_jsonl_atomic(&input_path, &input)?;
        clear_artifact(&output_path)?;

        let vars = ctx.placeholders(input_path, output_path.clone(), workdir, &lang);
        ctx.runner.run(phase, ToolKind::Translate, &vars, abort).await?;

        let returned: Vec<TextRow> = storage::read_jsonl_required(&output_path)?;
        let submitted: Vec<&str> = pending.iter().map(String::as_str).collect();
        verify_returned_set(&submitted, &returned, &output_path)?;
        for row in &returned {
            book.verify_hash(&row.paragraph_id, &row.content_hash, phase.as_str())?;
        }

        ctx.store_translations(&book, translations, returned)?;
        let now = Utc::now();
        for id in &pending {
            book.transition(id, to, now)?;
        }
        book.save()?;

        info!(%phase, %lang, paragraphs = pending.len(), "Translation pass done");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::IngestPhase;
    use super::super::testing::*;
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_pass1_translates_only_pending_paragraphs() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), "single-en", tools(dir.path(), REVIEW_PASS));
        let abort = AbortSignal::new();

        IngestPhase.run(&ctx, 0, &abort).await.unwrap();
        TranslatePhase::pass1().run(&ctx, 0, &abort).await.unwrap();

        let translations = ctx.load_translations().unwrap();
        assert_eq!(translations.len(), 3);
        assert_eq!(translations[1].text, "[en] Two.");

        // Nothing left in `ingested`, so a rerun submits nothing.
        std::fs::remove_file(ctx.layout.translate_dir(1).join("input.jsonl")).unwrap();
        TranslatePhase::pass1().run(&ctx, 0, &abort).await.unwrap();
        assert!(!ctx.layout.translate_dir(1).join("input.jsonl").exists());
    }

    #[tokio::test]
    async fn test_dropped_paragraph_is_missing() {
        let dir = tempdir().unwrap();
        let mut tools = tools(dir.path(), REVIEW_PASS);
        tools.insert(
            "translate".into(),
            script_tool(dir.path(), "drop_one", r#"head -n 2 "$1" > "$2""#),
        );
        let ctx = context(dir.path(), "single-en", tools);
        let abort = AbortSignal::new();

        IngestPhase.run(&ctx, 0, &abort).await.unwrap();
        let err = TranslatePhase::pass1().run(&ctx, 0, &abort).await.unwrap_err();
        assert!(matches!(
            err,
            PhaseError::State(StateError::MissingParagraph { ref paragraph_id, .. }) if paragraph_id == "p_0003"
        ));
        assert!(ctx.load_translations().unwrap().is_empty());
    }
}
