//! Storage gateway for test-report documents.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex as AsyncMutex};
use uuid::Uuid;

use crate::{
    error::StorageError,
    record::{Document, CREATED_AT_FIELD, ID_FIELD},
};

/// Narrow read/write interface to the document store.
#[async_trait]
pub trait ReportStore: fmt::Debug + Send + Sync {
    /// Verifies the store is reachable.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Every document in `collection`, in insertion order.
    async fn find_all(&self, collection: &str) -> Result<Vec<Document>, StorageError>;

    /// Persists `document`, assigning `_id` and `createdAt`. Returns the new id.
    async fn insert(&self, collection: &str, document: Document) -> Result<String, StorageError>;
}

/// Stamps the storage-owned metadata; any caller-supplied values are replaced.
fn stamp(mut document: Document) -> (String, Document) {
    let id = Uuid::new_v4().to_string();
    document.remove(ID_FIELD);
    document.remove(CREATED_AT_FIELD);
    let mut stamped = Document::new();
    stamped.insert(ID_FIELD.into(), id.clone().into());
    stamped.extend(document);
    stamped.insert(
        CREATED_AT_FIELD.into(),
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true).into(),
    );
    (id, stamped)
}

/// In-process store for development and tests.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    collections: RwLock<IndexMap<String, Vec<Document>>>,
    offline: AtomicBool,
}

impl MemoryReportStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) the connection.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::Unreachable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn ping(&self) -> Result<(), StorageError> {
        self.check()
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<Document>, StorageError> {
        self.check()?;
        Ok(self
            .collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, document: Document) -> Result<String, StorageError> {
        self.check()?;
        let (id, stamped) = stamp(document);
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(stamped);
        Ok(id)
    }
}

/// File-backed store: one `<collection>.jsonl` file per collection under a root directory.
#[derive(Debug)]
pub struct JsonlReportStore {
    root: PathBuf,
    write_lock: AsyncMutex<()>,
}

impl JsonlReportStore {
    /// Store rooted at `root`. The directory must exist for the store to be reachable.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: AsyncMutex::new(()),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.jsonl"))
    }
}

#[async_trait]
impl ReportStore for JsonlReportStore {
    async fn ping(&self) -> Result<(), StorageError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::Unreachable(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(err) => Err(StorageError::Unreachable(format!(
                "{}: {err}",
                self.root.display()
            ))),
        }
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<Document>, StorageError> {
        self.ping().await?;
        let raw = match tokio::fs::read_to_string(self.collection_path(collection)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|source| StorageError::Corrupt {
                    collection: collection.to_string(),
                    line: idx + 1,
                    source,
                })
            })
            .collect()
    }

    async fn insert(&self, collection: &str, document: Document) -> Result<String, StorageError> {
        self.ping().await?;
        let (id, stamped) = stamp(document);
        let mut line = serde_json::to_vec(&stamped)?;
        line.push(b'\n');
        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.collection_path(collection))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{example_record, REPORT_COLLECTION};
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_store_assigns_metadata() {
        let store = MemoryReportStore::new();
        assert!(store.find_all(REPORT_COLLECTION).await.unwrap().is_empty());
        let mut record = example_record();
        record.insert(ID_FIELD.into(), "caller-chosen".into());
        let id = store.insert(REPORT_COLLECTION, record).await.unwrap();
        let docs = store.find_all(REPORT_COLLECTION).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0][ID_FIELD], id.as_str());
        assert!(docs[0][CREATED_AT_FIELD].as_str().unwrap().ends_with('Z'));
        assert_eq!(docs[0]["storyPassed"], 90);
    }

    #[tokio::test]
    async fn offline_memory_store_is_unreachable() {
        let store = MemoryReportStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.ping().await,
            Err(StorageError::Unreachable(_))
        ));
        assert!(store.find_all(REPORT_COLLECTION).await.is_err());
        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn jsonl_store_round_trips_documents() {
        let dir = tempdir().unwrap();
        let store = JsonlReportStore::new(dir.path());
        assert!(store.find_all(REPORT_COLLECTION).await.unwrap().is_empty());
        let first = store.insert(REPORT_COLLECTION, example_record()).await.unwrap();
        let second = store.insert(REPORT_COLLECTION, example_record()).await.unwrap();
        assert_ne!(first, second);
        let docs = store.find_all(REPORT_COLLECTION).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1][ID_FIELD], second.as_str());
        assert_eq!(docs[0]["projectName"], "Project Alpha");
        assert!(dir.path().join("test_reports.jsonl").exists());
    }

    #[tokio::test]
    async fn jsonl_store_missing_root_is_unreachable() {
        let dir = tempdir().unwrap();
        let store = JsonlReportStore::new(dir.path().join("absent"));
        assert!(matches!(
            store.ping().await,
            Err(StorageError::Unreachable(_))
        ));
        assert!(store.insert(REPORT_COLLECTION, example_record()).await.is_err());
    }

    #[tokio::test]
    async fn jsonl_store_reports_corrupt_lines() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("test_reports.jsonl"), "{\"a\":1}\nnot json\n").unwrap();
        let store = JsonlReportStore::new(dir.path());
        match store.find_all(REPORT_COLLECTION).await {
            Err(StorageError::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }
}
