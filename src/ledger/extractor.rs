//! Ledger extraction: one unit's text in, one structured LedgerEntry out.

use super::callbacks::{self, Callback, CallbackStatus};
use super::entry::{CharacterState, LedgerEntry, Roster};
use crate::model::{parse_json, CompletionRequest, ModelCaller, Parsed, Purpose};
use crate::store::ContinuityStore;
use crate::{LedgerError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── JSON schema for the model's reply ───────────────────────────────

/// ```json
/// { "character_states": { "Mara": { "emotional_state": "...", ... } },
///   "group_dynamics": "...",
///   "callbacks": [ { "source_unit_index": 3, "moment": "...",
///                    "status": "used", "context": "..." } ] }
/// ```
#[derive(Debug, Deserialize)]
struct ExtractionJson {
    character_states: BTreeMap<String, CharacterState>,

    #[serde(default)]
    group_dynamics: String,

    #[serde(default)]
    callbacks: Vec<ExtractedCallback>,
}

#[derive(Debug, Deserialize)]
struct ExtractedCallback {
    /// Absent for moments set up in this very unit
    #[serde(default)]
    source_unit_index: Option<u32>,

    moment: String,

    #[serde(default = "default_status")]
    status: CallbackStatus,

    #[serde(default)]
    context: String,
}

fn default_status() -> CallbackStatus {
    CallbackStatus::Ripe
}

pub struct LedgerExtractor {
    model: ModelCaller,
    store: Arc<dyn ContinuityStore>,
    prune_age: u32,
}

impl LedgerExtractor {
    pub fn new(model: ModelCaller, store: Arc<dyn ContinuityStore>, prune_age: u32) -> Self {
        Self {
            model,
            store,
            prune_age,
        }
    }

    /// Extract and upsert the entry for `(work_id, unit_index)`.
    ///
    /// Returns `Ok(None)` when the model fails, times out, or replies with
    /// something that does not match the schema. A missing roster is
    /// [`LedgerError::SchemaNotFound`]; a failed write is
    /// [`LedgerError::Persistence`].
    pub async fn extract(
        &self,
        work_id: &str,
        unit_index: u32,
        unit_text: &str,
        roster: Option<&Roster>,
    ) -> Result<Option<LedgerEntry>> {
        let roster = match roster {
            Some(r) if !r.is_empty() => r,
            _ => return Err(LedgerError::SchemaNotFound(work_id.to_string())),
        };

        let prior_bank = self
            .store
            .latest_entry_before(work_id, unit_index)
            .await?
            .map(|e| e.callback_bank)
            .unwrap_or_default();

        let prompt = build_prompt(unit_index, unit_text, roster, &prior_bank);
        let reply = match self
            .model
            .call(Purpose::Extraction, CompletionRequest::json(prompt))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    "Extraction for '{}' unit {} failed: {}. Continuing without ledger entry.",
                    work_id, unit_index, e
                );
                return Ok(None);
            }
        };

        let extraction = match parse_extraction(&reply, unit_index).into_result() {
            Ok(extraction) => extraction,
            Err(e) => {
                warn!("Extraction for '{}' unit {}: {}", work_id, unit_index, e);
                return Ok(None);
            }
        };

        for name in extraction.character_states.keys() {
            if !roster.contains(name) {
                debug!("Extraction mentions '{}', who is not on the roster", name);
            }
        }

        let extracted: Vec<Callback> = extraction
            .callbacks
            .into_iter()
            .map(|c| Callback {
                source_unit_index: c.source_unit_index.unwrap_or(unit_index),
                moment: c.moment.trim().to_string(),
                status: c.status,
                context: c.context,
            })
            .collect();
        let bank = callbacks::prune(
            callbacks::merge(&prior_bank, &extracted),
            unit_index,
            self.prune_age,
        );

        let mut entry = LedgerEntry::new(work_id, unit_index)
            .with_group_dynamics(extraction.group_dynamics)
            .with_callbacks(bank);
        entry.character_states = extraction.character_states;
        entry.refresh_token_estimate();

        self.store.upsert_entry(&entry).await?;
        info!(
            "Recorded ledger for '{}' unit {}: {} characters, {} callbacks ({} ripe), ~{} tokens",
            work_id,
            unit_index,
            entry.character_states.len(),
            entry.callback_bank.len(),
            callbacks::ripe(&entry.callback_bank).len(),
            entry.token_estimate
        );
        Ok(Some(entry))
    }
}

fn parse_extraction(reply: &str, unit_index: u32) -> Parsed<ExtractionJson> {
    parse_json::<ExtractionJson>(reply).and_then(|extraction| {
        if extraction.character_states.keys().any(|k| k.trim().is_empty()) {
            return Err("character_states has an empty name".to_string());
        }
        for c in &extraction.callbacks {
            if c.moment.trim().is_empty() {
                return Err("callback with empty moment".to_string());
            }
            if let Some(src) = c.source_unit_index {
                if src > unit_index {
                    return Err(format!(
                        "callback source unit {} is after unit {}",
                        src, unit_index
                    ));
                }
            }
        }
        Ok(extraction)
    })
}

fn build_prompt(unit_index: u32, unit_text: &str, roster: &Roster, prior_bank: &[Callback]) -> String {
    let mut bank = String::new();
    if prior_bank.is_empty() {
        bank.push_str("(none yet)\n");
    }
    for c in prior_bank {
        let _ = writeln!(
            bank,
            "- source_unit_index={} status={} moment=\"{}\"",
            c.source_unit_index, c.status, c.moment
        );
    }

    format!(
        r#"You maintain a continuity ledger for a novel. Read chapter {unit_index} and record how EACH character subjectively experienced it.

=== Characters ===
{roster}
=== Callback bank so far ===
{bank}
=== Chapter {unit_index} ===
{unit_text}

Respond with a single JSON object:

{{"character_states": {{
    "<name>": {{
      "emotional_state": "...",
      "experience_from_pov": "what happened, as this character understood it",
      "new_knowledge": ["..."],
      "private_thoughts": "...",
      "relationship_shifts": {{
        "<other name>": {{"direction": "strengthening|deteriorating|complicated|stable", "detail": "...", "unresolved": true}}
      }}
    }}
  }},
  "group_dynamics": "...",
  "callbacks": [
    {{"source_unit_index": {unit_index}, "moment": "...", "status": "ripe", "context": "why it matters"}}
  ]
}}

For callbacks: add new moments from this chapter worth revisiting later (status "ripe"). For moments already in the bank, repeat their source_unit_index and exact moment text with status "used" if this chapter paid them off, or "expired" if they are no longer worth revisiting.

Output ONLY the JSON object."#,
        roster = roster.to_prompt_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::entry::CharacterProfile;
    use crate::model::{ScriptedModel, ScriptedReply};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn roster() -> Roster {
        Roster::new(vec![
            CharacterProfile::new("Mara").with_personality("guarded"),
            CharacterProfile::new("Tobin").with_motivation("debt"),
        ])
    }

    fn extractor(replies: Vec<ScriptedReply>) -> (LedgerExtractor, Arc<MemoryStore>) {
        let model = Arc::new(ScriptedModel::new(replies));
        let store = Arc::new(MemoryStore::new());
        let caller = ModelCaller::new(model, Duration::from_secs(5));
        (LedgerExtractor::new(caller, store.clone(), 3), store)
    }

    fn reply_unit(callbacks: serde_json::Value) -> ScriptedReply {
        ScriptedReply::json(json!({
            "character_states": {
                "Mara": {
                    "emotional_state": "shaken",
                    "experience_from_pov": "found the letter",
                    "new_knowledge": ["Tobin owes the guild"],
                    "private_thoughts": "he cannot be trusted",
                    "relationship_shifts": {
                        "Tobin": {"direction": "deteriorating", "detail": "lied", "unresolved": true}
                    }
                }
            },
            "group_dynamics": "tense",
            "callbacks": callbacks
        }))
    }

    #[tokio::test]
    async fn test_extract_records_entry() {
        let (extractor, store) = extractor(vec![reply_unit(json!([
            {"moment": "the unopened letter", "context": "Mara hid it"}
        ]))]);

        let entry = extractor
            .extract("w", 1, "Chapter text", Some(&roster()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(entry.character_states["Mara"].emotional_state, "shaken");
        assert_eq!(entry.callback_bank.len(), 1);
        assert_eq!(entry.callback_bank[0].source_unit_index, 1);
        assert_eq!(entry.callback_bank[0].status, CallbackStatus::Ripe);
        assert!(entry.token_estimate > 0);
        assert_eq!(store.entries("w").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_extract_merges_and_prunes_prior_bank() {
        let (extractor, store) = extractor(vec![reply_unit(json!([
            {"source_unit_index": 2, "moment": "the well oath", "status": "used"},
            {"moment": "a new scar"}
        ]))]);
        store
            .upsert_entry(&LedgerEntry::new("w", 5).with_callbacks(vec![
                Callback::ripe(2, "the well oath"),
                Callback::ripe(1, "old rumour").with_status(CallbackStatus::Expired),
                Callback::ripe(4, "the red door"),
            ]))
            .await
            .unwrap();

        let entry = extractor
            .extract("w", 6, "text", Some(&roster()))
            .await
            .unwrap()
            .unwrap();

        let bank: Vec<(&str, CallbackStatus)> = entry
            .callback_bank
            .iter()
            .map(|c| (c.moment.as_str(), c.status))
            .collect();
        // old rumour: expired and 5 units old -> pruned; well oath: used but
        // 4 units old -> pruned as well
        assert_eq!(
            bank,
            vec![
                ("the red door", CallbackStatus::Ripe),
                ("a new scar", CallbackStatus::Ripe),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_roster_is_schema_not_found() {
        let (extractor, _) = extractor(vec![reply_unit(json!([]))]);
        let err = extractor.extract("w", 1, "text", None).await.unwrap_err();
        assert!(matches!(err, LedgerError::SchemaNotFound(_)));

        let err = extractor
            .extract("w", 1, "text", Some(&Roster::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::SchemaNotFound(_)));
    }

    #[tokio::test]
    async fn test_malformed_reply_returns_none() {
        let (extractor, store) = extractor(vec![ScriptedReply::text("Sure! Here's a summary.")]);
        let result = extractor.extract("w", 1, "text", Some(&roster())).await.unwrap();
        assert!(result.is_none());
        assert!(store.entries("w").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_future_callback_source_is_malformed() {
        let (extractor, _) = extractor(vec![reply_unit(json!([
            {"source_unit_index": 9, "moment": "prophecy"}
        ]))]);
        let result = extractor.extract("w", 2, "text", Some(&roster())).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_model_error_returns_none() {
        let (extractor, _) = extractor(vec![ScriptedReply::error("503")]);
        let result = extractor.extract("w", 1, "text", Some(&roster())).await.unwrap();
        assert!(result.is_none());
    }
}
