use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};
use weft_types::{Event, EventId};
use weft_workflow::InstanceId;

use crate::error::{SuspensionError, SuspensionResult};
use crate::record::{AwaitedResponse, Resolution, SuspensionRecord};

/// Durable home of suspension records, one per suspended instance.
#[async_trait]
pub trait SuspensionStore: Send + Sync {
    /// Save (or replace) the record of an instance.
    async fn save(&self, record: SuspensionRecord) -> SuspensionResult<()>;

    async fn load(&self, instance: &InstanceId) -> SuspensionResult<SuspensionRecord>;

    /// Match a response against the instance's awaited requests and persist
    /// the result. Repeating a response never resolves twice.
    async fn resolve(&self, instance: &InstanceId, response: &Event) -> SuspensionResult<Resolution>;

    /// Delete the record. Returns whether one existed.
    async fn remove(&self, instance: &InstanceId) -> SuspensionResult<bool>;

    async fn list(&self) -> SuspensionResult<Vec<SuspensionRecord>>;

    /// Unresolved entries whose deadline is at or before `now_ms`.
    async fn due(&self, now_ms: u64) -> SuspensionResult<Vec<(InstanceId, AwaitedResponse)>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .flat_map(|record| {
                record
                    .due(now_ms)
                    .into_iter()
                    .map(|a| (record.instance.clone(), a.clone()))
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    /// The instance waiting for `request_id`, if any.
    async fn find_request(&self, request_id: &EventId) -> SuspensionResult<Option<InstanceId>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| r.awaits(request_id))
            .map(|r| r.instance))
    }
}

// ── In-memory ────────────────────────────────────────────────────────

/// Suspension records kept in memory. Does not survive a restart.
#[derive(Default)]
pub struct InMemorySuspensionStore {
    records: Mutex<BTreeMap<InstanceId, SuspensionRecord>>,
}

impl InMemorySuspensionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SuspensionStore for InMemorySuspensionStore {
    async fn save(&self, record: SuspensionRecord) -> SuspensionResult<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.instance.clone(), record);
        Ok(())
    }

    async fn load(&self, instance: &InstanceId) -> SuspensionResult<SuspensionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance)
            .cloned()
            .ok_or_else(|| SuspensionError::NotFound(instance.clone()))
    }

    async fn resolve(&self, instance: &InstanceId, response: &Event) -> SuspensionResult<Resolution> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(instance)
            .ok_or_else(|| SuspensionError::NotFound(instance.clone()))?;
        Ok(record.resolve(response))
    }

    async fn remove(&self, instance: &InstanceId) -> SuspensionResult<bool> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance)
            .is_some())
    }

    async fn list(&self) -> SuspensionResult<Vec<SuspensionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }
}

// ── File-backed ──────────────────────────────────────────────────────

/// One JSON file per suspended instance.
///
/// Writes go to a `.tmp` file that is then renamed over the record, so a
/// crash leaves either the old or the new record, never a partial one.
pub struct FileSuspensionStore {
    dir: PathBuf,
    // Serializes read-modify-write in `resolve`.
    write: tokio::sync::Mutex<()>,
}

impl FileSuspensionStore {
    pub fn open(dir: impl Into<PathBuf>) -> SuspensionResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, instance: &InstanceId) -> PathBuf {
        let name: String = instance
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    async fn write_record(&self, record: &SuspensionRecord) -> SuspensionResult<()> {
        let path = self.path_for(&record.instance);
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_record(&self, instance: &InstanceId) -> SuspensionResult<SuspensionRecord> {
        let path = self.path_for(instance);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SuspensionError::NotFound(instance.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SuspensionStore for FileSuspensionStore {
    async fn save(&self, record: SuspensionRecord) -> SuspensionResult<()> {
        let _write = self.write.lock().await;
        self.write_record(&record).await?;
        debug!(instance_id = %record.instance, awaiting = record.awaiting.len(), "Suspension saved");
        Ok(())
    }

    async fn load(&self, instance: &InstanceId) -> SuspensionResult<SuspensionRecord> {
        self.read_record(instance).await
    }

    async fn resolve(&self, instance: &InstanceId, response: &Event) -> SuspensionResult<Resolution> {
        let _write = self.write.lock().await;
        let mut record = self.read_record(instance).await?;
        let resolution = record.resolve(response);
        if matches!(resolution, Resolution::Resolved(_)) {
            self.write_record(&record).await?;
        }
        Ok(resolution)
    }

    async fn remove(&self, instance: &InstanceId) -> SuspensionResult<bool> {
        let _write = self.write.lock().await;
        match tokio::fs::remove_file(self.path_for(instance)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> SuspensionResult<Vec<SuspensionRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<SuspensionRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable suspension record"),
            }
        }
        records.sort_by(|a, b| a.instance.cmp(&b.instance));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::{record, response};

    async fn exercise(store: &dyn SuspensionStore) {
        let rec = record("i-1", Some(5_000));
        let request = rec.awaiting[0].request_id;
        store.save(rec.clone()).await.unwrap();
        store.save(record("i-2", None)).await.unwrap();

        assert_eq!(store.load(&rec.instance).await.unwrap(), rec);
        assert_eq!(store.list().await.unwrap().len(), 2);
        assert_eq!(store.find_request(&request).await.unwrap(), Some(rec.instance.clone()));

        let due = store.due(6_000).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, rec.instance);

        let answer = response(&request, "hil.response");
        assert!(matches!(
            store.resolve(&rec.instance, &answer).await.unwrap(),
            Resolution::Resolved(_)
        ));
        assert!(matches!(
            store.resolve(&rec.instance, &answer).await.unwrap(),
            Resolution::AlreadyResolved(_)
        ));
        assert!(store.due(6_000).await.unwrap().is_empty());
        assert_eq!(store.find_request(&request).await.unwrap(), None);

        assert!(store.remove(&rec.instance).await.unwrap());
        assert!(!store.remove(&rec.instance).await.unwrap());
        assert!(matches!(
            store.load(&rec.instance).await,
            Err(SuspensionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn in_memory_store_contract() {
        exercise(&InMemorySuspensionStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileSuspensionStore::open(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record("wf:instance/1", None);
        let request = rec.awaiting[0].request_id;
        {
            let store = FileSuspensionStore::open(dir.path()).unwrap();
            store.save(rec.clone()).await.unwrap();
            store
                .resolve(&rec.instance, &response(&request, "hil.response"))
                .await
                .unwrap();
        }

        let store = FileSuspensionStore::open(dir.path()).unwrap();
        let loaded = store.load(&rec.instance).await.unwrap();
        assert!(loaded.awaiting[0].is_resolved());
        assert!(!dir.path().join("wf_instance_1.tmp").exists());
    }
}
