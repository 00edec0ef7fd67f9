//! In-process store backed by ordered maps.

use super::{sort_series, ContinuityStore, UnitRecord, WorkInfo};
use crate::ledger::LedgerEntry;
use crate::review::VoiceReviewRecord;
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

type UnitKey = (String, u32);

/// Store that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<UnitKey, LedgerEntry>>,
    reviews: RwLock<BTreeMap<UnitKey, VoiceReviewRecord>>,
    units: RwLock<BTreeMap<UnitKey, UnitRecord>>,
    works: RwLock<HashMap<String, WorkInfo>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContinuityStore for MemoryStore {
    async fn upsert_entry(&self, entry: &LedgerEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert((entry.work_id.clone(), entry.unit_index), entry.clone());
        Ok(())
    }

    async fn entries(&self, work_id: &str) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range((work_id.to_string(), 0)..=(work_id.to_string(), u32::MAX))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn entry(&self, work_id: &str, unit_index: u32) -> Result<Option<LedgerEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(work_id.to_string(), unit_index))
            .cloned())
    }

    async fn upsert_review(&self, review: &VoiceReviewRecord) -> Result<()> {
        self.reviews
            .write()
            .await
            .insert((review.work_id.clone(), review.unit_index), review.clone());
        Ok(())
    }

    async fn review(&self, work_id: &str, unit_index: u32) -> Result<Option<VoiceReviewRecord>> {
        Ok(self
            .reviews
            .read()
            .await
            .get(&(work_id.to_string(), unit_index))
            .cloned())
    }

    async fn upsert_unit(&self, unit: &UnitRecord) -> Result<()> {
        self.units
            .write()
            .await
            .insert((unit.work_id.clone(), unit.unit_index), unit.clone());
        Ok(())
    }

    async fn unit(&self, work_id: &str, unit_index: u32) -> Result<Option<UnitRecord>> {
        Ok(self
            .units
            .read()
            .await
            .get(&(work_id.to_string(), unit_index))
            .cloned())
    }

    async fn upsert_work(&self, work: &WorkInfo) -> Result<()> {
        self.works
            .write()
            .await
            .insert(work.work_id.clone(), work.clone());
        Ok(())
    }

    async fn work(&self, work_id: &str) -> Result<Option<WorkInfo>> {
        Ok(self.works.read().await.get(work_id).cloned())
    }

    async fn series_works(&self, series_id: &str) -> Result<Vec<WorkInfo>> {
        let mut works: Vec<WorkInfo> = self
            .works
            .read()
            .await
            .values()
            .filter(|w| w.series_id.as_deref() == Some(series_id))
            .cloned()
            .collect();
        sort_series(&mut works);
        Ok(works)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_are_scoped_and_sorted() {
        let store = MemoryStore::new();
        store.upsert_entry(&LedgerEntry::new("a", 3)).await.unwrap();
        store.upsert_entry(&LedgerEntry::new("a", 1)).await.unwrap();
        store.upsert_entry(&LedgerEntry::new("ab", 2)).await.unwrap();

        let units: Vec<u32> = store
            .entries("a")
            .await
            .unwrap()
            .iter()
            .map(|e| e.unit_index)
            .collect();
        assert_eq!(units, vec![1, 3]);
        assert_eq!(store.latest_entry("a").await.unwrap().unwrap().unit_index, 3);
        assert_eq!(
            store
                .latest_entry_before("a", 3)
                .await
                .unwrap()
                .unwrap()
                .unit_index,
            1
        );
        assert!(store.latest_entry_before("a", 1).await.unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces_by_key() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store
                .upsert_entry(&LedgerEntry::new("w", 1).with_group_dynamics("first"))
                .await
                .unwrap();
            store
                .upsert_entry(&LedgerEntry::new("w", 1).with_group_dynamics("second"))
                .await
                .unwrap();

            let entries = store.entries("w").await.unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].group_dynamics, "second");
        });
    }

    #[tokio::test]
    async fn test_series_works_ordered() {
        let store = MemoryStore::new();
        store
            .upsert_work(&WorkInfo::new("b3").in_series("s", 3))
            .await
            .unwrap();
        store
            .upsert_work(&WorkInfo::new("b1").in_series("s", 1))
            .await
            .unwrap();
        store
            .upsert_work(&WorkInfo::new("other").in_series("t", 1))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .series_works("s")
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.work_id)
            .collect();
        assert_eq!(ids, vec!["b1", "b3"]);
    }
}
