//! Directory-of-JSON-files store.
//!
//! Directory layout:
//!   {root}/works/{work_id}/work.json
//!   {root}/works/{work_id}/ledger/{unit_index:05}.json
//!   {root}/works/{work_id}/reviews/{unit_index:05}.json
//!   {root}/works/{work_id}/units/{unit_index:05}.json
//!
//! Each record is written to a temporary file and renamed into place, so a
//! reader never observes a half-written record.

use super::{sort_series, ContinuityStore, UnitRecord, WorkInfo};
use crate::ledger::LedgerEntry;
use crate::review::VoiceReviewRecord;
use crate::{LedgerError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const LEDGER_DIR: &str = "ledger";
const REVIEWS_DIR: &str = "reviews";
const UNITS_DIR: &str = "units";
const WORK_FILE: &str = "work.json";

pub struct JsonFileStore {
    works_dir: PathBuf,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: &Path) -> Result<Self> {
        let works_dir = root.join("works");
        fs::create_dir_all(&works_dir)
            .await
            .map_err(|e| LedgerError::Persistence(format!("create {:?}: {e}", works_dir)))?;
        info!("Opened JSON store at {:?}", root);
        Ok(Self { works_dir })
    }

    fn work_dir(&self, work_id: &str) -> Result<PathBuf> {
        let valid = !work_id.is_empty()
            && work_id != "."
            && work_id != ".."
            && !work_id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(LedgerError::Persistence(format!(
                "invalid work id for file store: {work_id:?}"
            )));
        }
        Ok(self.works_dir.join(work_id))
    }

    fn record_path(&self, work_id: &str, kind: &str, unit_index: u32) -> Result<PathBuf> {
        Ok(self
            .work_dir(work_id)?
            .join(kind)
            .join(format!("{unit_index:05}.json")))
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let persist = |e: std::io::Error| LedgerError::Persistence(format!("write {:?}: {e}", path));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(persist)?;
        }
        let content = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .await
            .map_err(persist)?;
        file.write_all(content.as_bytes()).await.map_err(persist)?;
        file.flush().await.map_err(persist)?;
        drop(file);
        fs::rename(&tmp, path).await.map_err(persist)?;

        debug!("Wrote {:?}", path);
        Ok(())
    }

    /// Read one record; a missing file is `None`, an unreadable one is logged and skipped.
    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| LedgerError::Persistence(format!("read {:?}: {e}", path)))?;
        match serde_json::from_str::<T>(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Failed to parse {:?}: {}", path, e);
                Ok(None)
            }
        }
    }

    async fn read_dir_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        let mut read_dir = fs::read_dir(dir)
            .await
            .map_err(|e| LedgerError::Persistence(format!("list {:?}: {e}", dir)))?;
        while let Some(item) = read_dir
            .next_entry()
            .await
            .map_err(|e| LedgerError::Persistence(format!("list {:?}: {e}", dir)))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        // Zero-padded names sort numerically
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(record) = Self::read_json(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ContinuityStore for JsonFileStore {
    async fn upsert_entry(&self, entry: &LedgerEntry) -> Result<()> {
        let path = self.record_path(&entry.work_id, LEDGER_DIR, entry.unit_index)?;
        Self::write_json(&path, entry).await
    }

    async fn entries(&self, work_id: &str) -> Result<Vec<LedgerEntry>> {
        let dir = self.work_dir(work_id)?.join(LEDGER_DIR);
        let mut entries: Vec<LedgerEntry> = Self::read_dir_records(&dir).await?;
        entries.sort_by_key(|e| e.unit_index);
        Ok(entries)
    }

    async fn entry(&self, work_id: &str, unit_index: u32) -> Result<Option<LedgerEntry>> {
        Self::read_json(&self.record_path(work_id, LEDGER_DIR, unit_index)?).await
    }

    async fn upsert_review(&self, review: &VoiceReviewRecord) -> Result<()> {
        let path = self.record_path(&review.work_id, REVIEWS_DIR, review.unit_index)?;
        Self::write_json(&path, review).await
    }

    async fn review(&self, work_id: &str, unit_index: u32) -> Result<Option<VoiceReviewRecord>> {
        Self::read_json(&self.record_path(work_id, REVIEWS_DIR, unit_index)?).await
    }

    async fn upsert_unit(&self, unit: &UnitRecord) -> Result<()> {
        let path = self.record_path(&unit.work_id, UNITS_DIR, unit.unit_index)?;
        Self::write_json(&path, unit).await
    }

    async fn unit(&self, work_id: &str, unit_index: u32) -> Result<Option<UnitRecord>> {
        Self::read_json(&self.record_path(work_id, UNITS_DIR, unit_index)?).await
    }

    async fn upsert_work(&self, work: &WorkInfo) -> Result<()> {
        let path = self.work_dir(&work.work_id)?.join(WORK_FILE);
        Self::write_json(&path, work).await
    }

    async fn work(&self, work_id: &str) -> Result<Option<WorkInfo>> {
        Self::read_json(&self.work_dir(work_id)?.join(WORK_FILE)).await
    }

    async fn series_works(&self, series_id: &str) -> Result<Vec<WorkInfo>> {
        let mut works = Vec::new();
        let mut read_dir = fs::read_dir(&self.works_dir)
            .await
            .map_err(|e| LedgerError::Persistence(format!("list {:?}: {e}", self.works_dir)))?;
        while let Some(item) = read_dir
            .next_entry()
            .await
            .map_err(|e| LedgerError::Persistence(format!("list {:?}: {e}", self.works_dir)))?
        {
            let path = item.path().join(WORK_FILE);
            if let Some(work) = Self::read_json::<WorkInfo>(&path).await? {
                if work.series_id.as_deref() == Some(series_id) {
                    works.push(work);
                }
            }
        }
        sort_series(&mut works);
        Ok(works)
    }
}
