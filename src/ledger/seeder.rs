//! Cross-book seeding: carrying the final state of earlier books into a sequel.
//!
//! A sequel with no ledger of its own starts from the last recorded entry of
//! every earlier book in its series, plus every callback those books left
//! open. The seed is derived on demand and never persisted.

use super::callbacks::{Callback, CallbackStatus};
use super::entry::LedgerEntry;
use crate::store::{ContinuityStore, WorkInfo};
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One earlier book's contribution to a seed
#[derive(Debug, Clone)]
pub struct SeedSource {
    pub work: WorkInfo,

    /// Highest-unit entry of that book
    pub final_entry: LedgerEntry,

    /// Callbacks of the final entry not yet paid off
    pub open_callbacks: Vec<Callback>,
}

impl SeedSource {
    /// Name used when rendering this book
    pub fn label(&self) -> &str {
        self.work.title.as_deref().unwrap_or(&self.work.work_id)
    }
}

/// Final state of every earlier book in a series, oldest book first
#[derive(Debug, Clone)]
pub struct SeedBlock {
    pub sources: Vec<SeedSource>,
}

impl SeedBlock {
    /// Every carried-over callback with the book it came from, oldest book first
    pub fn callbacks(&self) -> impl Iterator<Item = (&SeedSource, &Callback)> {
        self.sources
            .iter()
            .flat_map(|s| s.open_callbacks.iter().map(move |c| (s, c)))
    }
}

pub struct CrossBookSeeder {
    store: Arc<dyn ContinuityStore>,
}

impl CrossBookSeeder {
    pub fn new(store: Arc<dyn ContinuityStore>) -> Self {
        Self { store }
    }

    /// Build the seed for `work_id`.
    ///
    /// `None` unless the work is a sequel, has no entries of its own, and at
    /// least one earlier book has a recorded final state.
    pub async fn seed_for(&self, work_id: &str) -> Result<Option<SeedBlock>> {
        let Some(work) = self.store.work(work_id).await? else {
            debug!("No work info for '{}', not seeding", work_id);
            return Ok(None);
        };
        if !work.is_sequel() {
            return Ok(None);
        }
        if !self.store.entries(work_id).await?.is_empty() {
            return Ok(None);
        }

        let chain = self.prior_works(&work).await?;
        let mut sources = Vec::with_capacity(chain.len());
        for prior in chain {
            let Some(final_entry) = self.store.latest_entry(&prior.work_id).await? else {
                debug!("'{}' has no ledger, skipping in seed", prior.work_id);
                continue;
            };
            let open_callbacks = final_entry
                .callback_bank
                .iter()
                .filter(|c| c.status != CallbackStatus::Used)
                .cloned()
                .collect();
            sources.push(SeedSource {
                work: prior,
                final_entry,
                open_callbacks,
            });
        }

        if sources.is_empty() {
            warn!(
                "'{}' is a sequel but no earlier book has a ledger; starting without a seed",
                work_id
            );
            return Ok(None);
        }

        info!(
            "Seeded '{}' from {} earlier book(s), {} open callbacks",
            work_id,
            sources.len(),
            sources.iter().map(|s| s.open_callbacks.len()).sum::<usize>()
        );
        Ok(Some(SeedBlock { sources }))
    }

    /// Earlier books of the series, ascending.
    ///
    /// Uses `series_order` when the work has one; otherwise follows
    /// `parent_work_id` links back to the first book.
    async fn prior_works(&self, work: &WorkInfo) -> Result<Vec<WorkInfo>> {
        if let (Some(series_id), Some(order)) = (&work.series_id, work.series_order) {
            let prior: Vec<WorkInfo> = self
                .store
                .series_works(series_id)
                .await?
                .into_iter()
                .filter(|w| w.work_id != work.work_id && w.series_order.is_some_and(|o| o < order))
                .collect();
            if !prior.is_empty() {
                return Ok(prior);
            }
        }

        let mut chain = Vec::new();
        let mut visited = HashSet::from([work.work_id.clone()]);
        let mut next = work.parent_work_id.clone();
        while let Some(parent_id) = next {
            if !visited.insert(parent_id.clone()) {
                warn!("Sequel chain of '{}' loops at '{}'", work.work_id, parent_id);
                break;
            }
            let parent = self
                .store
                .work(&parent_id)
                .await?
                .unwrap_or_else(|| WorkInfo::new(parent_id.clone()));
            next = parent.parent_work_id.clone();
            chain.push(parent);
        }
        chain.reverse();
        Ok(chain)
    }
}
