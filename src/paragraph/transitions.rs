//! Compiled-in paragraph state graph.
//!
//! Every persisted status change goes through [`assert_pipeline_transition_allowed`].
//! Illegal moves fail loudly; nothing is clamped.

use super::{ParagraphRecord, ParagraphStatus};
use crate::errors::StateError;

use ParagraphStatus::*;

/// Forward edges of the pipeline. Statuses absent from the left column have no exits.
pub const ALLOWED_TRANSITIONS: &[(ParagraphStatus, &[ParagraphStatus])] = &[
    (Ingested, &[TranslatedPass1]),
    (TranslatedPass1, &[TranslatedPass2, CandidateAssembled]),
    (TranslatedPass2, &[CandidateAssembled]),
    (CandidateAssembled, &[ReviewInProgress]),
    (
        ReviewInProgress,
        &[ReadyToMerge, ReworkQueued, ManualReviewRequired],
    ),
    (ReworkQueued, &[Reworked, ManualReviewRequired]),
    (Reworked, &[TranslatedPass1, ReviewInProgress]),
    (ReadyToMerge, &[Merged]),
];

/// Statuses reachable in one step from `from`.
pub fn allowed_targets(from: ParagraphStatus) -> &'static [ParagraphStatus] {
    ALLOWED_TRANSITIONS
        .iter()
        .find(|(source, _)| *source == from)
        .map(|(_, targets)| *targets)
        .unwrap_or(&[])
}

/// Check that `record` may be persisted with status `to`.
///
/// - Excluded paragraphs may only hold `ingested` or keep `merged`.
/// - `review_failed` is never persisted.
/// - A write that keeps the status unchanged is accepted.
/// - Anything else must be an edge of [`ALLOWED_TRANSITIONS`].
pub fn assert_pipeline_transition_allowed(
    record: &ParagraphRecord,
    to: ParagraphStatus,
) -> Result<(), StateError> {
    let from = record.status;

    if record.excluded_by_policy {
        let allowed = to == Ingested || (to == Merged && from == Merged);
        if !allowed {
            return Err(StateError::ExcludedParagraphActivation {
                paragraph_id: record.paragraph_id.clone(),
                to: to.to_string(),
            });
        }
        return Ok(());
    }

    if to == ReviewFailed || from == ReviewFailed {
        return Err(illegal(record, to));
    }

    if from == to || allowed_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(illegal(record, to))
    }
}

fn illegal(record: &ParagraphRecord, to: ParagraphStatus) -> StateError {
    StateError::IllegalTransition {
        paragraph_id: record.paragraph_id.clone(),
        from: record.status.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(status: ParagraphStatus, excluded: bool) -> ParagraphRecord {
        let mut r = ParagraphRecord::seeded("p_0001", "hash", excluded, Utc::now());
        r.status = status;
        r
    }

    #[test]
    fn test_every_documented_edge_is_accepted() {
        for (from, targets) in ALLOWED_TRANSITIONS {
            for to in *targets {
                assert!(
                    assert_pipeline_transition_allowed(&record(*from, false), *to).is_ok(),
                    "{from} -> {to} should be allowed"
                );
            }
        }
    }

    #[test]
    fn test_every_undocumented_edge_is_rejected() {
        for from in ParagraphStatus::ALL {
            for to in ParagraphStatus::ALL {
                let documented = allowed_targets(from).contains(&to);
                let same = from == to && from != ReviewFailed;
                let result = assert_pipeline_transition_allowed(&record(from, false), to);
                assert_eq!(
                    result.is_ok(),
                    documented || same,
                    "{from} -> {to} acceptance mismatch"
                );
            }
        }
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        assert!(allowed_targets(ManualReviewRequired).is_empty());
        assert!(allowed_targets(Merged).is_empty());
        assert!(ManualReviewRequired.is_terminal());
        assert!(Merged.is_terminal());
    }

    #[test]
    fn test_review_failed_never_persisted() {
        let err = assert_pipeline_transition_allowed(&record(ReviewInProgress, false), ReviewFailed)
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));
    }

    #[test]
    fn test_backward_move_fails_loudly() {
        let err =
            assert_pipeline_transition_allowed(&record(ReadyToMerge, false), Ingested).unwrap_err();
        match err {
            StateError::IllegalTransition { from, to, .. } => {
                assert_eq!(from, "ready_to_merge");
                assert_eq!(to, "ingested");
            }
            other => panic!("expected IllegalTransition, got {other:?}"),
        }
    }

    #[test]
    fn test_excluded_paragraph_cannot_activate() {
        for to in ParagraphStatus::ALL {
            let result = assert_pipeline_transition_allowed(&record(Ingested, true), to);
            if to == Ingested {
                assert!(result.is_ok());
            } else {
                assert!(matches!(
                    result,
                    Err(StateError::ExcludedParagraphActivation { .. })
                ));
            }
        }
    }

    #[test]
    fn test_excluded_merged_stays_merged() {
        assert!(assert_pipeline_transition_allowed(&record(Merged, true), Merged).is_ok());
        assert!(assert_pipeline_transition_allowed(&record(ReworkQueued, true), Ingested).is_ok());
        assert!(assert_pipeline_transition_allowed(&record(Ingested, true), Merged).is_err());
    }
}
