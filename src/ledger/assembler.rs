//! Context assembly: turning the ledger into a bounded prompt block.
//!
//! Entries within the recency window are rendered verbatim, older ones through
//! their compressed summary, newest first, with the latest callback bank as a
//! trailing section. Rendering is a pure function of the history and a
//! window; assembly tries each window in turn until the block fits the token
//! budget.

use super::compress::Compressor;
use super::entry::{estimate_tokens, LedgerEntry};
use super::seeder::{CrossBookSeeder, SeedBlock};
use crate::config::ContinuityConfig;
use crate::store::ContinuityStore;
use crate::Result;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

const UNIT_HEADER: &str = "Use this record of how each character experienced the story so far. \
Keep their emotional states, knowledge and relationships consistent, \
and look for chances to pay off open callbacks.";

const SEED_HEADER: &str = "This book continues an earlier one. Below is where each character \
stood at the end of the previous book(s). Carry their states and relationships forward, \
and look for chances to pay off callbacks left open.";

/// A context block ready to be injected into a generation request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    pub text: String,

    /// `ceil(chars / 4)` of `text`
    pub estimated_tokens: usize,

    /// Recency window of the pass that produced `text`
    pub window_used: Option<u32>,

    /// Whole sections dropped after every window was exhausted
    pub dropped_sections: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// One rendered slice of history
struct HistoryItem {
    label: String,

    /// Units (or books) between this item and the target
    distance: u32,

    entry: LedgerEntry,
    summary: Option<String>,
}

struct History {
    header: String,

    /// Newest first
    items: Vec<HistoryItem>,

    callback_lines: Vec<String>,
}

pub struct ContextAssembler {
    store: Arc<dyn ContinuityStore>,
    compressor: Compressor,
    seeder: CrossBookSeeder,
    token_budget: usize,
    windows: Vec<u32>,
}

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn ContinuityStore>,
        compressor: Compressor,
        seeder: CrossBookSeeder,
        config: &ContinuityConfig,
    ) -> Self {
        let mut windows = vec![config.recency_window];
        if config.fallback_recency_window < config.recency_window {
            windows.push(config.fallback_recency_window);
        }
        Self {
            store,
            compressor,
            seeder,
            token_budget: config.token_budget,
            windows,
        }
    }

    /// Assemble the context block for generating `target_unit` of `work_id`.
    pub async fn assemble(&self, work_id: &str, target_unit: u32) -> Result<AssembledContext> {
        let entries: Vec<LedgerEntry> = self
            .store
            .entries(work_id)
            .await?
            .into_iter()
            .filter(|e| e.unit_index < target_unit)
            .collect();

        let mut history = if !entries.is_empty() {
            unit_history(target_unit, entries)
        } else if let Some(seed) = self.seeder.seed_for(work_id).await? {
            seed_history(seed)
        } else {
            debug!("No history for '{}' unit {}", work_id, target_unit);
            return Ok(AssembledContext::default());
        };

        let mut sections = Vec::new();
        for &window in &self.windows {
            self.compress_outside(&mut history, window).await?;
            sections = render(&history, window);
            let estimated_tokens = estimate_tokens(&join(&sections));
            if estimated_tokens <= self.token_budget {
                info!(
                    "Assembled context for '{}' unit {}: ~{} tokens (window {})",
                    work_id, target_unit, estimated_tokens, window
                );
                return Ok(AssembledContext {
                    text: join(&sections),
                    estimated_tokens,
                    window_used: Some(window),
                    dropped_sections: 0,
                });
            }
            debug!(
                "Context for '{}' unit {} is ~{} tokens with window {}, over budget {}",
                work_id, target_unit, estimated_tokens, window, self.token_budget
            );
        }

        let window = self.windows.last().copied();
        let (text, dropped_sections) = fit_by_dropping(sections, self.token_budget);
        let estimated_tokens = estimate_tokens(&text);
        warn!(
            "Context for '{}' unit {} still over budget; dropped {} section(s), ~{} tokens",
            work_id, target_unit, dropped_sections, estimated_tokens
        );
        Ok(AssembledContext {
            text,
            estimated_tokens,
            window_used: window,
            dropped_sections,
        })
    }

    /// Fill in summaries for every item outside `window` that lacks one.
    async fn compress_outside(&self, history: &mut History, window: u32) -> Result<()> {
        for item in history.items.iter_mut().filter(|i| i.distance > window) {
            if item.summary.is_none() {
                item.summary = Some(self.compressor.ensure_summary(&mut item.entry).await?);
            }
        }
        Ok(())
    }
}

fn unit_history(target_unit: u32, mut entries: Vec<LedgerEntry>) -> History {
    entries.sort_by(|a, b| b.unit_index.cmp(&a.unit_index));

    let callback_lines = entries
        .first()
        .map(|latest| {
            latest
                .callback_bank
                .iter()
                .map(|c| {
                    let mut line = format!("- [{}] (unit {}) {}", c.status, c.source_unit_index, c.moment);
                    if !c.context.is_empty() {
                        let _ = write!(line, ": {}", c.context);
                    }
                    line
                })
                .collect()
        })
        .unwrap_or_default();

    let items = entries
        .into_iter()
        .map(|entry| HistoryItem {
            label: format!("Unit {}", entry.unit_index),
            distance: target_unit.saturating_sub(entry.unit_index),
            summary: entry.compressed_summary.clone(),
            entry,
        })
        .collect();

    History {
        header: format!("=== STORY CONTINUITY (before unit {}) ===\n{}", target_unit, UNIT_HEADER),
        items,
        callback_lines,
    }
}

/// The seed as "unit 0" history: books newest first, the window counting books.
fn seed_history(seed: SeedBlock) -> History {
    let callback_lines = seed
        .callbacks()
        .map(|(source, c)| {
            let mut line = format!(
                "- [{}] ({}, unit {}) {}",
                c.status,
                source.label(),
                c.source_unit_index,
                c.moment
            );
            if !c.context.is_empty() {
                let _ = write!(line, ": {}", c.context);
            }
            line
        })
        .collect();

    let books = seed.sources.len() as u32;
    let items = seed
        .sources
        .into_iter()
        .enumerate()
        .rev()
        .map(|(rank, source)| HistoryItem {
            label: format!("{} (final state)", source.label()),
            distance: books - rank as u32,
            summary: source.final_entry.compressed_summary.clone(),
            entry: source.final_entry,
        })
        .collect();

    History {
        header: format!("=== SERIES CONTINUITY ===\n{}", SEED_HEADER),
        items,
        callback_lines,
    }
}

/// Render the history for one window: header, items newest first, callback bank.
///
/// Items outside the window must already carry a summary.
fn render(history: &History, window: u32) -> Vec<String> {
    let mut sections = Vec::with_capacity(history.items.len() + 2);
    sections.push(history.header.clone());

    for item in &history.items {
        let section = match (&item.summary, item.distance > window) {
            (Some(summary), true) => format!("--- {} (summary) ---\n{}", item.label, summary),
            _ => format!("--- {} ---\n{}", item.label, item.entry.render_full().trim_end()),
        };
        sections.push(section);
    }

    if !history.callback_lines.is_empty() {
        sections.push(format!(
            "=== CALLBACK BANK ===\n{}",
            history.callback_lines.join("\n")
        ));
    }
    sections
}

fn join(sections: &[String]) -> String {
    sections.join("\n\n")
}

/// Last resort once every window is over budget.
///
/// Drops history sections oldest first; if the header and callback bank alone
/// still overflow, drops the oldest callback lines, then the header.
fn fit_by_dropping(mut sections: Vec<String>, budget: usize) -> (String, usize) {
    let fits = |s: &[String]| estimate_tokens(&join(s)) <= budget;
    let has_bank = sections
        .last()
        .is_some_and(|s| s.starts_with("=== CALLBACK BANK ==="));
    let mut dropped = 0;

    // sections: [header, items newest..oldest, bank?]
    let history_end = if has_bank { sections.len() - 1 } else { sections.len() };
    let mut oldest = history_end;
    while !fits(&sections) && oldest > 1 {
        oldest -= 1;
        sections.remove(oldest);
        dropped += 1;
    }

    if !fits(&sections) && has_bank {
        warn!("Callback bank alone exceeds the context budget; dropping oldest callbacks");
        if let Some(bank) = sections.pop() {
            let mut lines: Vec<&str> = bank.lines().collect();
            // lines[0] is the section title
            while lines.len() > 1 {
                lines.remove(1);
                let mut trial = sections.clone();
                trial.push(lines.join("\n"));
                if fits(&trial) {
                    sections = trial;
                    return (join(&sections), dropped);
                }
            }
            dropped += 1;
        }
    }

    while !fits(&sections) && !sections.is_empty() {
        sections.remove(0);
        dropped += 1;
    }
    (join(&sections), dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::callbacks::{Callback, CallbackStatus};
    use crate::ledger::entry::CharacterState;
    use crate::model::{ModelCaller, ScriptedModel, ScriptedReply};
    use crate::store::{MemoryStore, WorkInfo};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn assembler(
        config: &ContinuityConfig,
        replies: Vec<ScriptedReply>,
    ) -> (ContextAssembler, Arc<ScriptedModel>, Arc<MemoryStore>) {
        let model = Arc::new(ScriptedModel::new(replies));
        let store = Arc::new(MemoryStore::new());
        let caller = ModelCaller::new(model.clone(), Duration::from_secs(5));
        let assembler = ContextAssembler::new(
            store.clone(),
            Compressor::new(caller, store.clone()),
            CrossBookSeeder::new(store.clone()),
            config,
        );
        (assembler, model, store)
    }

    fn entry(unit: u32, filler_chars: usize) -> LedgerEntry {
        let filler: String = "word ".repeat(filler_chars / 5);
        LedgerEntry::new("w", unit)
            .with_character("Mara", CharacterState::new(format!("mood {unit}")))
            .with_group_dynamics(filler)
            .with_callbacks(vec![Callback::ripe(unit, format!("moment {unit}"))])
    }

    #[tokio::test]
    async fn test_first_unit_is_empty() {
        let (assembler, model, _) = assembler(&ContinuityConfig::default(), vec![]);
        let context = assembler.assemble("w", 1).await.unwrap();
        assert!(context.is_empty());
        assert_eq!(context.window_used, None);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_layout_newest_first_with_bank_last() {
        let (assembler, _, store) = assembler(
            &ContinuityConfig::default(),
            vec![ScriptedReply::text("Unit one in brief.")],
        );
        for unit in 1..=4 {
            store.upsert_entry(&entry(unit, 50)).await.unwrap();
        }

        let context = assembler.assemble("w", 5).await.unwrap();
        let text = &context.text;
        let header = text.find("STORY CONTINUITY").unwrap();
        let u4 = text.find("--- Unit 4 ---").unwrap();
        let u2 = text.find("--- Unit 2 ---").unwrap();
        let u1 = text.find("--- Unit 1 (summary) ---").unwrap();
        let bank = text.find("=== CALLBACK BANK ===").unwrap();
        assert!(header < u4 && u4 < u2 && u2 < u1 && u1 < bank);
        assert!(text.contains("Unit one in brief."));
        // Only the latest entry's bank is appended
        assert!(text.contains("moment 4"));
        assert!(!text.contains("moment 3"));
        assert_eq!(context.window_used, Some(3));
        assert_eq!(context.estimated_tokens, estimate_tokens(text));
    }

    #[tokio::test]
    async fn test_entries_at_or_after_target_are_ignored() {
        let (assembler, _, store) = assembler(&ContinuityConfig::default(), vec![]);
        store.upsert_entry(&entry(1, 10)).await.unwrap();
        store.upsert_entry(&entry(2, 10)).await.unwrap();

        let context = assembler.assemble("w", 2).await.unwrap();
        assert!(context.text.contains("--- Unit 1 ---"));
        assert!(!context.text.contains("Unit 2"));
    }

    #[tokio::test]
    async fn test_tighter_window_keeps_twenty_units_in_budget() {
        let (assembler, model, store) = assembler(
            &ContinuityConfig::default(),
            vec![ScriptedReply::text("Short summary.")],
        );
        for unit in 1..=20 {
            store.upsert_entry(&entry(unit, 6_800)).await.unwrap();
        }

        let context = assembler.assemble("w", 21).await.unwrap();
        assert!(context.estimated_tokens <= 5_000, "{}", context.estimated_tokens);
        assert_eq!(context.window_used, Some(2));
        assert_eq!(context.dropped_sections, 0);
        assert!(context.text.contains("--- Unit 20 ---"));
        assert!(context.text.contains("--- Unit 19 ---"));
        assert!(context.text.contains("--- Unit 18 (summary) ---"));
        // Units 1..=17 on the first pass, unit 18 on the second
        assert_eq!(model.call_count(), 18);
    }

    #[tokio::test]
    async fn test_compression_happens_once_per_entry() {
        let (assembler, model, store) = assembler(
            &ContinuityConfig::default(),
            vec![ScriptedReply::text("Compressed.")],
        );
        for unit in 1..=4 {
            store.upsert_entry(&entry(unit, 20)).await.unwrap();
        }

        for _ in 0..5 {
            assembler.assemble("w", 5).await.unwrap();
        }
        assert_eq!(model.call_count(), 1);
        let stored = store.entry("w", 1).await.unwrap().unwrap();
        assert_eq!(stored.compressed_summary.as_deref(), Some("Compressed."));
    }

    #[tokio::test]
    async fn test_drops_oldest_sections_as_last_resort() {
        let config = ContinuityConfig::default()
            .with_token_budget(400)
            .with_recency_windows(1, 1);
        let (assembler, _, store) = assembler(&config, vec![ScriptedReply::text("Brief.")]);
        for unit in 1..=3 {
            store.upsert_entry(&entry(unit, 2_000)).await.unwrap();
        }

        let context = assembler.assemble("w", 4).await.unwrap();
        assert!(context.estimated_tokens <= 400);
        assert!(context.dropped_sections > 0);
        assert!(context.text.contains("=== CALLBACK BANK ==="));
        assert!(!context.text.contains("--- Unit 1 (summary) ---"));
    }

    #[tokio::test]
    async fn test_sequel_uses_seed_as_history() {
        let (assembler, _, store) = assembler(&ContinuityConfig::default(), vec![]);
        store
            .upsert_work(&WorkInfo::new("b1").with_title("Book One").in_series("s", 1))
            .await
            .unwrap();
        store
            .upsert_work(&WorkInfo::new("b2").in_series("s", 2).sequel_to("b1"))
            .await
            .unwrap();
        store
            .upsert_entry(
                &LedgerEntry::new("b1", 12)
                    .with_group_dynamics("scattered after the fire")
                    .with_callbacks(vec![
                        Callback::ripe(3, "the locked chest"),
                        Callback::ripe(4, "the debt").with_status(CallbackStatus::Used),
                    ]),
            )
            .await
            .unwrap();

        let context = assembler.assemble("b2", 1).await.unwrap();
        assert!(context.text.contains("SERIES CONTINUITY"));
        assert!(context.text.contains("--- Book One (final state) ---"));
        assert!(context.text.contains("scattered after the fire"));
        assert!(context.text.contains("(Book One, unit 3) the locked chest"));
        assert!(!context.text.contains("the debt"));
    }

    #[test]
    fn test_fit_by_dropping_trims_callbacks_when_bank_alone_overflows() {
        let bank = format!(
            "=== CALLBACK BANK ===\n{}",
            (0..20)
                .map(|i| format!("- [ripe] (unit {i}) a fairly long callback moment number {i}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        let sections = vec!["header".to_string(), "old".repeat(100), bank];

        let (text, dropped) = fit_by_dropping(sections, 60);
        assert!(estimate_tokens(&text) <= 60);
        assert_eq!(dropped, 1);
        assert!(text.contains("number 19"));
        assert!(!text.contains("number 0\n"));
    }
}
