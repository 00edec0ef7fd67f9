//! Engine - the pipeline-facing facade
//!
//! Wires the components to one model and one store, and serialises every
//! operation on a work through a per-work async mutex. Different works run
//! concurrently; two calls on the same work never interleave.

use crate::config::ContinuityConfig;
use crate::ledger::{
    AssembledContext, Compressor, ContextAssembler, CrossBookSeeder, LedgerEntry, LedgerExtractor,
    Roster,
};
use crate::model::{LanguageModel, ModelCaller, UsageTally};
use crate::review::{SurgicalReviser, VoiceReviewRecord, VoiceReviewer};
use crate::store::{ContinuityStore, UnitRecord, WorkInfo};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

/// What a combined review-and-revise pass produced
#[derive(Debug, Clone, Default)]
pub struct ReviewOutcome {
    /// `None` when the review was skipped
    pub review: Option<VoiceReviewRecord>,

    /// `Some` only when a revision was applied
    pub revised_text: Option<String>,
}

pub struct Engine {
    store: Arc<dyn ContinuityStore>,
    extractor: LedgerExtractor,
    assembler: ContextAssembler,
    reviewer: VoiceReviewer,
    reviser: SurgicalReviser,
    usage: Arc<UsageTally>,
    work_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn ContinuityStore>,
        config: &ContinuityConfig,
    ) -> Result<Self> {
        config.validate()?;

        let usage = Arc::new(UsageTally::new());
        let caller = ModelCaller::new(model, config.model_timeout()).with_usage(usage.clone());

        let assembler = ContextAssembler::new(
            store.clone(),
            Compressor::new(caller.clone(), store.clone()),
            CrossBookSeeder::new(store.clone()),
            config,
        );

        Ok(Self {
            extractor: LedgerExtractor::new(caller.clone(), store.clone(), config.prune_age),
            assembler,
            reviewer: VoiceReviewer::new(caller.clone(), store.clone()),
            reviser: SurgicalReviser::new(caller, store.clone(), config.revision_threshold),
            store,
            usage,
            work_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> Arc<dyn ContinuityStore> {
        self.store.clone()
    }

    /// Token usage of every model call made through this engine
    pub fn usage(&self) -> Arc<UsageTally> {
        self.usage.clone()
    }

    async fn lock_work(&self, work_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .work_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(work_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn register_work(&self, work: &WorkInfo) -> Result<()> {
        let _guard = self.lock_work(&work.work_id).await;
        self.store.upsert_work(work).await?;
        info!("Registered work '{}'", work.work_id);
        Ok(())
    }

    /// Store a freshly generated unit and extract its ledger entry.
    pub async fn record_unit(
        &self,
        work_id: &str,
        unit_index: u32,
        unit_text: &str,
        roster: Option<&Roster>,
    ) -> Result<Option<LedgerEntry>> {
        let _guard = self.lock_work(work_id).await;
        self.store
            .upsert_unit(&UnitRecord::new(work_id, unit_index, unit_text))
            .await?;
        self.extractor
            .extract(work_id, unit_index, unit_text, roster)
            .await
    }

    /// Context block for generating `unit_index`.
    pub async fn context_for(&self, work_id: &str, unit_index: u32) -> Result<AssembledContext> {
        let _guard = self.lock_work(work_id).await;
        self.assembler.assemble(work_id, unit_index).await
    }

    pub async fn review_unit(
        &self,
        work_id: &str,
        unit_index: u32,
        unit_text: &str,
        roster: Option<&Roster>,
    ) -> Result<Option<VoiceReviewRecord>> {
        let _guard = self.lock_work(work_id).await;
        self.reviewer
            .review(work_id, unit_index, unit_text, roster)
            .await
    }

    /// Revise a stored unit against its stored review.
    pub async fn revise_unit(
        &self,
        work_id: &str,
        unit_index: u32,
        roster: Option<&Roster>,
    ) -> Result<Option<String>> {
        let _guard = self.lock_work(work_id).await;

        let Some(review) = self.store.review(work_id, unit_index).await? else {
            warn!("No review for '{}' unit {}; nothing to revise", work_id, unit_index);
            return Ok(None);
        };
        let Some(unit) = self.store.unit(work_id, unit_index).await? else {
            warn!("No stored text for '{}' unit {}; cannot revise", work_id, unit_index);
            return Ok(None);
        };
        self.reviser.revise(&review, &unit.text, roster).await
    }

    /// Review a unit and, if the review calls for it, revise it in one step.
    pub async fn review_and_revise(
        &self,
        work_id: &str,
        unit_index: u32,
        unit_text: &str,
        roster: Option<&Roster>,
    ) -> Result<ReviewOutcome> {
        let _guard = self.lock_work(work_id).await;

        let Some(review) = self
            .reviewer
            .review(work_id, unit_index, unit_text, roster)
            .await?
        else {
            return Ok(ReviewOutcome::default());
        };
        let revised_text = self.reviser.revise(&review, unit_text, roster).await?;
        // The reviser persists its own copy with the flag set
        let review = match &revised_text {
            Some(_) => self.store.review(work_id, unit_index).await?.or(Some(review)),
            None => Some(review),
        };
        Ok(ReviewOutcome {
            review,
            revised_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CharacterProfile;
    use crate::model::{ScriptedModel, ScriptedReply};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn engine(replies: Vec<ScriptedReply>) -> (Engine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let model = Arc::new(ScriptedModel::new(replies));
        let engine = Engine::new(model, store.clone(), &ContinuityConfig::default()).unwrap();
        (engine, store)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let store = Arc::new(MemoryStore::new());
        let model = Arc::new(ScriptedModel::new(vec![]));
        let config = ContinuityConfig::default().with_token_budget(0);
        assert!(Engine::new(model, store, &config).is_err());
    }

    #[tokio::test]
    async fn test_record_unit_stores_text_and_entry() {
        let (engine, store) = engine(vec![ScriptedReply::json(json!({
            "character_states": {"Mara": {"emotional_state": "calm"}},
            "group_dynamics": "settled"
        }))]);
        let roster = Roster::new(vec![CharacterProfile::new("Mara")]);

        let entry = engine
            .record_unit("w", 1, "Chapter one.", Some(&roster))
            .await
            .unwrap();
        assert!(entry.is_some());
        assert_eq!(store.unit("w", 1).await.unwrap().unwrap().text, "Chapter one.");
        assert_eq!(engine.usage().calls(crate::model::Purpose::Extraction), 1);
    }

    #[tokio::test]
    async fn test_review_and_revise_marks_records() {
        let (engine, store) = engine(vec![
            ScriptedReply::json(json!({
                "voice_checks": [{"character": "Mara", "authenticity_score": 0.6, "flags": ["off"]}],
                "overall_assessment": "needs work"
            })),
            ScriptedReply::text("Revised chapter."),
        ]);
        let roster = Roster::new(vec![CharacterProfile::new("Mara")]);

        let outcome = engine
            .review_and_revise("w", 1, "Draft chapter.", Some(&roster))
            .await
            .unwrap();

        assert_eq!(outcome.revised_text.as_deref(), Some("Revised chapter."));
        assert!(outcome.review.unwrap().revision_applied);
        assert!(store.unit("w", 1).await.unwrap().unwrap().revision_applied);
    }

    #[tokio::test]
    async fn test_same_work_calls_are_serialised() {
        let store = Arc::new(MemoryStore::new());
        let model = Arc::new(ScriptedModel::new(vec![ScriptedReply::delayed(
            Duration::from_millis(50),
            ScriptedReply::text("not json"),
        )]));
        let engine = Arc::new(Engine::new(model, store, &ContinuityConfig::default()).unwrap());
        let roster = Roster::new(vec![CharacterProfile::new("Mara")]);

        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(
            engine.record_unit("w", 1, "one", Some(&roster)),
            engine.record_unit("w", 2, "two", Some(&roster)),
        );
        assert!(a.unwrap().is_none());
        assert!(b.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
