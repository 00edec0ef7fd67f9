//! Surgical revision: rewriting only what the voice review flagged.

use super::reviewer::{VoiceCheck, VoiceReviewRecord};
use crate::ledger::Roster;
use crate::model::{strip_code_fences, CompletionRequest, ModelCaller, Purpose};
use crate::store::{ContinuityStore, UnitRecord};
use crate::Result;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

const REVISER_SYSTEM: &str = "You are a line editor. You change only what you are asked to change \
and return the full text.";

/// Whether a review crosses the revision threshold.
///
/// True if any character scores below `threshold` or missed any callback.
pub fn needs_revision(review: &VoiceReviewRecord, threshold: f64) -> bool {
    review
        .voice_checks
        .iter()
        .any(|c| flagged(c, threshold))
}

fn flagged(check: &VoiceCheck, threshold: f64) -> bool {
    check.authenticity_score < threshold || !check.missed_callbacks.is_empty()
}

pub struct SurgicalReviser {
    model: ModelCaller,
    store: Arc<dyn ContinuityStore>,
    threshold: f64,
}

impl SurgicalReviser {
    pub fn new(model: ModelCaller, store: Arc<dyn ContinuityStore>, threshold: f64) -> Self {
        Self {
            model,
            store,
            threshold,
        }
    }

    /// Revise `unit_text` if `review` calls for it.
    ///
    /// On success the revised text replaces the stored unit and both the unit
    /// and the review are marked `revision_applied`. Returns `Ok(None)` when no
    /// revision is needed or the model could not produce one.
    pub async fn revise(
        &self,
        review: &VoiceReviewRecord,
        unit_text: &str,
        roster: Option<&Roster>,
    ) -> Result<Option<String>> {
        if !needs_revision(review, self.threshold) {
            debug!(
                "'{}' unit {} passes voice review, no revision",
                review.work_id, review.unit_index
            );
            return Ok(None);
        }

        let prompt = build_prompt(review, unit_text, roster, self.threshold);
        let reply = match self
            .model
            .call(
                Purpose::Revision,
                CompletionRequest::text(prompt).with_system(REVISER_SYSTEM),
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    "Revision of '{}' unit {} failed: {}. Keeping original text.",
                    review.work_id, review.unit_index, e
                );
                return Ok(None);
            }
        };

        let revised = strip_code_fences(&reply).trim();
        if revised.is_empty() {
            warn!(
                "Revision of '{}' unit {} came back empty. Keeping original text.",
                review.work_id, review.unit_index
            );
            return Ok(None);
        }
        let revised = revised.to_string();

        let mut unit = UnitRecord::new(&review.work_id, review.unit_index, revised.clone());
        unit.revision_applied = true;
        self.store.upsert_unit(&unit).await?;

        let mut reviewed = review.clone();
        reviewed.revision_applied = true;
        self.store.upsert_review(&reviewed).await?;

        info!(
            "Revised '{}' unit {} ({} -> {} chars)",
            review.work_id,
            review.unit_index,
            unit_text.chars().count(),
            revised.chars().count()
        );
        Ok(Some(revised))
    }
}

fn build_prompt(
    review: &VoiceReviewRecord,
    unit_text: &str,
    roster: Option<&Roster>,
    threshold: f64,
) -> String {
    let mut changes = String::new();
    for check in review.voice_checks.iter().filter(|c| flagged(c, threshold)) {
        let _ = writeln!(
            changes,
            "- {} (authenticity {:.2})",
            check.character, check.authenticity_score
        );
        if let Some(voice) = roster
            .and_then(|r| r.get(&check.character))
            .and_then(|p| p.voice.as_deref())
        {
            let _ = writeln!(changes, "  Voice: {}", voice);
        }
        for flag in &check.flags {
            let _ = writeln!(changes, "  Fix: {}", flag);
        }
        for missed in &check.missed_callbacks {
            let _ = writeln!(changes, "  Work in callback: {}", missed);
        }
    }

    format!(
        r#"Revise the chapter below. Make ONLY the changes listed; leave every other sentence exactly as it is.

=== Changes ===
{changes}
=== Chapter ===
{unit_text}

Return the complete revised chapter text and nothing else."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CharacterProfile;
    use crate::model::{ScriptedModel, ScriptedReply};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn check(character: &str, score: f64, missed: &[&str]) -> VoiceCheck {
        VoiceCheck {
            character: character.to_string(),
            authenticity_score: score,
            flags: vec![],
            missed_callbacks: missed.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn reviser(replies: Vec<ScriptedReply>) -> (SurgicalReviser, Arc<ScriptedModel>, Arc<MemoryStore>) {
        let model = Arc::new(ScriptedModel::new(replies));
        let store = Arc::new(MemoryStore::new());
        let caller = ModelCaller::new(model.clone(), Duration::from_secs(5));
        (SurgicalReviser::new(caller, store.clone(), 0.8), model, store)
    }

    #[test]
    fn test_threshold_rule() {
        let low = VoiceReviewRecord::new("w", 1, vec![check("Mara", 0.75, &[])], "");
        assert!(needs_revision(&low, 0.8));

        let fine = VoiceReviewRecord::new(
            "w",
            1,
            vec![check("Mara", 0.8, &[]), check("Tobin", 0.95, &[])],
            "",
        );
        assert!(!needs_revision(&fine, 0.8));

        let missed = VoiceReviewRecord::new("w", 1, vec![check("Mara", 0.99, &["the letter"])], "");
        assert!(needs_revision(&missed, 0.8));
    }

    #[tokio::test]
    async fn test_no_revision_needed_returns_none() {
        let (reviser, model, _) = reviser(vec![ScriptedReply::text("rewritten")]);
        let review = VoiceReviewRecord::new("w", 1, vec![check("Mara", 0.9, &[])], "");
        assert!(reviser.revise(&review, "orig", None).await.unwrap().is_none());
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_revision_persists_text_and_flags() {
        let (reviser, model, store) =
            reviser(vec![ScriptedReply::text("```\nMara said little.\n```")]);
        let mut mara = check("Mara", 0.75, &["the letter"]);
        mara.flags.push("too talkative".to_string());
        let review = VoiceReviewRecord::new("w", 2, vec![mara, check("Tobin", 0.9, &[])], "");
        store.upsert_review(&review).await.unwrap();

        let roster = Roster::new(vec![CharacterProfile::new("Mara").with_voice("terse")]);
        let revised = reviser
            .revise(&review, "Mara talked a lot.", Some(&roster))
            .await
            .unwrap();

        assert_eq!(revised.as_deref(), Some("Mara said little."));
        let unit = store.unit("w", 2).await.unwrap().unwrap();
        assert_eq!(unit.text, "Mara said little.");
        assert!(unit.revision_applied);
        assert!(store.review("w", 2).await.unwrap().unwrap().revision_applied);

        let prompt = &model.prompts()[0];
        assert!(prompt.contains("Mara (authenticity 0.75)"));
        assert!(prompt.contains("Voice: terse"));
        assert!(prompt.contains("Fix: too talkative"));
        assert!(prompt.contains("Work in callback: the letter"));
        assert!(!prompt.contains("Tobin"));
    }

    #[tokio::test]
    async fn test_empty_reply_keeps_original() {
        let (reviser, _, store) = reviser(vec![ScriptedReply::text("   ")]);
        let review = VoiceReviewRecord::new("w", 1, vec![check("Mara", 0.5, &[])], "");
        assert!(reviser.revise(&review, "orig", None).await.unwrap().is_none());
        assert!(store.unit("w", 1).await.unwrap().is_none());
    }
}
