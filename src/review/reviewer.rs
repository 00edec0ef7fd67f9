//! Voice review: scoring a new unit against the whole ledger history.

use crate::ledger::{CallbackStatus, LedgerEntry, Roster};
use crate::model::{parse_json, CompletionRequest, ModelCaller, Parsed, Purpose};
use crate::store::ContinuityStore;
use crate::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

/// One character's voice check within a review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceCheck {
    pub character: String,

    /// 1.0 = unmistakably this character; must lie in `[0, 1]`
    pub authenticity_score: f64,

    #[serde(default)]
    pub flags: Vec<String>,

    /// Open callbacks this character should have touched and did not
    #[serde(default)]
    pub missed_callbacks: Vec<String>,
}

/// Stored review of one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceReviewRecord {
    pub work_id: String,
    pub unit_index: u32,
    pub voice_checks: Vec<VoiceCheck>,

    #[serde(default)]
    pub overall_assessment: String,

    /// Sum of flags and missed callbacks across all checks
    pub flags_count: usize,

    #[serde(default)]
    pub revision_applied: bool,

    pub reviewed_at: DateTime<Utc>,
}

impl VoiceReviewRecord {
    pub fn new(
        work_id: impl Into<String>,
        unit_index: u32,
        voice_checks: Vec<VoiceCheck>,
        overall_assessment: impl Into<String>,
    ) -> Self {
        let flags_count = voice_checks
            .iter()
            .map(|c| c.flags.len() + c.missed_callbacks.len())
            .sum();
        Self {
            work_id: work_id.into(),
            unit_index,
            voice_checks,
            overall_assessment: overall_assessment.into(),
            flags_count,
            revision_applied: false,
            reviewed_at: Utc::now(),
        }
    }

    /// Lowest authenticity score in the review, if any character was checked
    pub fn lowest_score(&self) -> Option<f64> {
        self.voice_checks
            .iter()
            .map(|c| c.authenticity_score)
            .reduce(f64::min)
    }
}

#[derive(Debug, Deserialize)]
struct ReviewJson {
    voice_checks: Vec<VoiceCheck>,

    #[serde(default)]
    overall_assessment: String,
}

pub struct VoiceReviewer {
    model: ModelCaller,
    store: Arc<dyn ContinuityStore>,
}

impl VoiceReviewer {
    pub fn new(model: ModelCaller, store: Arc<dyn ContinuityStore>) -> Self {
        Self { model, store }
    }

    /// Review `unit_text` against every ledger entry before `unit_index`.
    ///
    /// Returns `Ok(None)` when the model fails or its reply is malformed
    /// (including any score outside `[0, 1]`).
    pub async fn review(
        &self,
        work_id: &str,
        unit_index: u32,
        unit_text: &str,
        roster: Option<&Roster>,
    ) -> Result<Option<VoiceReviewRecord>> {
        let roster = match roster {
            Some(r) if !r.is_empty() => r,
            _ => return Err(LedgerError::SchemaNotFound(work_id.to_string())),
        };

        let history: Vec<LedgerEntry> = self
            .store
            .entries(work_id)
            .await?
            .into_iter()
            .filter(|e| e.unit_index < unit_index)
            .collect();

        let prompt = build_prompt(unit_index, unit_text, roster, &history);
        let reply = match self
            .model
            .call(Purpose::Review, CompletionRequest::json(prompt))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    "Voice review of '{}' unit {} failed: {}. Skipping review.",
                    work_id, unit_index, e
                );
                return Ok(None);
            }
        };

        let parsed = match parse_review(&reply).into_result() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Voice review of '{}' unit {}: {}", work_id, unit_index, e);
                return Ok(None);
            }
        };

        let record = VoiceReviewRecord::new(
            work_id,
            unit_index,
            parsed.voice_checks,
            parsed.overall_assessment,
        );
        self.store.upsert_review(&record).await?;
        info!(
            "Reviewed '{}' unit {}: {} characters, {} flags, lowest score {:.2}",
            work_id,
            unit_index,
            record.voice_checks.len(),
            record.flags_count,
            record.lowest_score().unwrap_or(1.0)
        );
        Ok(Some(record))
    }
}

fn parse_review(reply: &str) -> Parsed<ReviewJson> {
    parse_json::<ReviewJson>(reply).and_then(|review| {
        for check in &review.voice_checks {
            if check.character.trim().is_empty() {
                return Err("voice check without a character".to_string());
            }
            let score = check.authenticity_score;
            if !score.is_finite() || !(0.0..=1.0).contains(&score) {
                return Err(format!(
                    "authenticity_score {} for '{}' is outside [0, 1]",
                    score, check.character
                ));
            }
        }
        Ok(review)
    })
}

fn build_prompt(unit_index: u32, unit_text: &str, roster: &Roster, history: &[LedgerEntry]) -> String {
    let mut record = String::new();
    if history.is_empty() {
        record.push_str("(this is the first unit)\n");
    }
    for entry in history {
        let _ = writeln!(record, "--- Unit {} ---", entry.unit_index);
        record.push_str(&entry.render_full());
    }

    let mut open = String::new();
    if let Some(latest) = history.last() {
        for c in latest
            .callback_bank
            .iter()
            .filter(|c| c.status == CallbackStatus::Ripe)
        {
            let _ = writeln!(open, "- (unit {}) {}", c.source_unit_index, c.moment);
        }
    }
    if open.is_empty() {
        open.push_str("(none)\n");
    }

    format!(
        r#"You are a continuity editor checking that every character sounds like themselves.

=== Characters ===
{roster}
=== Continuity record so far ===
{record}
=== Open callbacks ===
{open}
=== Unit {unit_index} (to review) ===
{unit_text}

For each character who appears in unit {unit_index}, judge whether their voice, choices and knowledge match the record. Score authenticity from 0.0 (not this character) to 1.0 (unmistakably them). Flag specific problems, and list open callbacks this character should naturally have touched but did not.

Respond with a single JSON object:

{{"voice_checks": [
    {{"character": "<name>", "authenticity_score": 0.0, "flags": ["..."], "missed_callbacks": ["..."]}}
  ],
  "overall_assessment": "..."}}

Output ONLY the JSON object."#,
        roster = roster.to_prompt_string(),
    )
}
