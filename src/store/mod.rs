//! Persistent store for ledger entries, voice reviews, unit texts and works.
//!
//! The store is the single source of truth. Writes are upserts keyed by
//! `(work_id, unit_index)`, so there is exactly one entry, review and unit
//! record per key.

mod json_file;
mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use crate::ledger::LedgerEntry;
use crate::review::VoiceReviewRecord;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External reference data about one work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkInfo {
    pub work_id: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub series_id: Option<String>,

    /// Position in the series, ascending from the first book
    #[serde(default)]
    pub series_order: Option<u32>,

    /// The book this one is a sequel to
    #[serde(default)]
    pub parent_work_id: Option<String>,
}

impl WorkInfo {
    pub fn new(work_id: impl Into<String>) -> Self {
        Self {
            work_id: work_id.into(),
            title: None,
            series_id: None,
            series_order: None,
            parent_work_id: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn in_series(mut self, series_id: impl Into<String>, order: u32) -> Self {
        self.series_id = Some(series_id.into());
        self.series_order = Some(order);
        self
    }

    pub fn sequel_to(mut self, parent_work_id: impl Into<String>) -> Self {
        self.parent_work_id = Some(parent_work_id.into());
        self
    }

    pub fn is_sequel(&self) -> bool {
        self.parent_work_id.is_some()
    }
}

/// The stored text of one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub work_id: String,
    pub unit_index: u32,
    pub text: String,

    #[serde(default)]
    pub revision_applied: bool,

    pub updated_at: DateTime<Utc>,
}

impl UnitRecord {
    pub fn new(work_id: impl Into<String>, unit_index: u32, text: impl Into<String>) -> Self {
        Self {
            work_id: work_id.into(),
            unit_index,
            text: text.into(),
            revision_applied: false,
            updated_at: Utc::now(),
        }
    }
}

/// Storage operations the continuity core needs.
///
/// Every write failure surfaces as [`crate::LedgerError::Persistence`].
#[async_trait]
pub trait ContinuityStore: Send + Sync {
    async fn upsert_entry(&self, entry: &LedgerEntry) -> Result<()>;

    /// All entries of a work, ascending by `unit_index`
    async fn entries(&self, work_id: &str) -> Result<Vec<LedgerEntry>>;

    async fn entry(&self, work_id: &str, unit_index: u32) -> Result<Option<LedgerEntry>>;

    /// Highest-`unit_index` entry of a work (its final state once finished)
    async fn latest_entry(&self, work_id: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.entries(work_id).await?.pop())
    }

    /// Highest-`unit_index` entry strictly before `unit_index`
    async fn latest_entry_before(
        &self,
        work_id: &str,
        unit_index: u32,
    ) -> Result<Option<LedgerEntry>> {
        Ok(self
            .entries(work_id)
            .await?
            .into_iter()
            .filter(|e| e.unit_index < unit_index)
            .next_back())
    }

    async fn upsert_review(&self, review: &VoiceReviewRecord) -> Result<()>;

    async fn review(&self, work_id: &str, unit_index: u32) -> Result<Option<VoiceReviewRecord>>;

    async fn upsert_unit(&self, unit: &UnitRecord) -> Result<()>;

    async fn unit(&self, work_id: &str, unit_index: u32) -> Result<Option<UnitRecord>>;

    async fn upsert_work(&self, work: &WorkInfo) -> Result<()>;

    async fn work(&self, work_id: &str) -> Result<Option<WorkInfo>>;

    /// Every work of a series, ascending by `series_order`
    async fn series_works(&self, series_id: &str) -> Result<Vec<WorkInfo>>;
}

/// Order works by series position, unordered works last, ties by id.
pub(crate) fn sort_series(works: &mut [WorkInfo]) {
    works.sort_by(|a, b| {
        let ka = (a.series_order.is_none(), a.series_order, &a.work_id);
        let kb = (b.series_order.is_none(), b.series_order, &b.work_id);
        ka.cmp(&kb)
    });
}
