//! Continuity compression: shrinking aged ledger entries into short summaries.
//!
//! An entry is compressed the first time it falls outside the assembler's
//! recency window. The summary is cached on the entry and persisted, so each
//! entry costs at most one successful model call over the life of a work.
//! If the model fails, a deterministic placeholder is used instead and
//! nothing is cached, leaving the next assembly free to try again.

use super::callbacks::ripe;
use super::entry::LedgerEntry;
use crate::model::{CompletionRequest, ModelCaller, Purpose};
use crate::store::ContinuityStore;
use crate::Result;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on summary length, in words
const MAX_SUMMARY_WORDS: usize = 150;

/// Completion cap for a summary; comfortably above 150 words
const SUMMARY_MAX_TOKENS: u32 = 400;

/// Prompt sent to the model to compress one unit's continuity state
pub const COMPRESSION_PROMPT: &str = r#"You are compressing a story continuity record. Write a 100-150 word summary of where the characters stand after this chapter, for a writer who will continue the story.

Keep:
- The current state of every relationship, and which way it is moving
- Every open callback listed below (moments still worth paying off)
- Every unresolved tension

Drop:
- Dialogue-level detail and scene blocking
- Anything already paid off or abandoned

Write plain prose, no headings, no lists."#;

pub struct Compressor {
    model: ModelCaller,
    store: Arc<dyn ContinuityStore>,
}

impl Compressor {
    pub fn new(model: ModelCaller, store: Arc<dyn ContinuityStore>) -> Self {
        Self { model, store }
    }

    /// The placeholder used when compression is unavailable
    pub fn placeholder(unit_index: u32) -> String {
        format!("Unit {}: state compressed unavailable", unit_index)
    }

    /// Return the entry's summary, computing and persisting it on first use.
    ///
    /// Only persistence failures are returned as errors; model failures yield
    /// the placeholder.
    pub async fn ensure_summary(&self, entry: &mut LedgerEntry) -> Result<String> {
        if let Some(summary) = &entry.compressed_summary {
            return Ok(summary.clone());
        }

        match self.summarize(entry).await {
            Some(summary) => {
                entry.compressed_summary = Some(summary.clone());
                self.store.upsert_entry(entry).await?;
                info!(
                    "Compressed unit {} of '{}' ({} -> {} words)",
                    entry.unit_index,
                    entry.work_id,
                    entry.render_full().split_whitespace().count(),
                    summary.split_whitespace().count()
                );
                Ok(summary)
            }
            None => Ok(Self::placeholder(entry.unit_index)),
        }
    }

    async fn summarize(&self, entry: &LedgerEntry) -> Option<String> {
        let prompt = format!(
            "{}\n\n=== CONTINUITY RECORD (UNIT {}) ===\n{}\n=== YOUR SUMMARY ===",
            COMPRESSION_PROMPT,
            entry.unit_index,
            compression_input(entry)
        );

        match self
            .model
            .call(
                Purpose::Compression,
                CompletionRequest::text(prompt).with_max_tokens(SUMMARY_MAX_TOKENS),
            )
            .await
        {
            Ok(text) => {
                let summary = cap_words(text.trim(), MAX_SUMMARY_WORDS);
                if summary.is_empty() {
                    warn!(
                        "Compression of unit {} returned nothing. Using placeholder.",
                        entry.unit_index
                    );
                    None
                } else {
                    Some(summary)
                }
            }
            Err(e) => {
                warn!(
                    "Compression of unit {} failed: {}. Using placeholder.",
                    entry.unit_index, e
                );
                None
            }
        }
    }
}

/// What the model sees: full states, unresolved tensions, and only ripe callbacks.
fn compression_input(entry: &LedgerEntry) -> String {
    let mut input = entry.render_full();

    let tensions = entry.unresolved_tensions();
    if !tensions.is_empty() {
        input.push_str("\nUnresolved tensions:\n");
        for (from, to, shift) in tensions {
            let _ = writeln!(input, "- {} / {}: {}", from, to, shift.detail);
        }
    }

    let open = ripe(&entry.callback_bank);
    if !open.is_empty() {
        input.push_str("\nOpen callbacks:\n");
        for c in open {
            let _ = writeln!(input, "- (unit {}) {}", c.source_unit_index, c.moment);
        }
    }

    input
}

/// Cut `text` to at most `max_words`, preferring a sentence boundary.
fn cap_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        return words.join(" ");
    }

    let capped = words[..max_words].join(" ");
    match capped.rfind(['.', '!', '?']) {
        Some(pos) if pos > capped.len() / 2 => capped[..=pos].to_string(),
        _ => capped,
    }
}
