//! File-based persistence backend: one JSON map file, rewritten on change

use crate::{PersistenceStore, StorageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// File format version
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Default)]
struct StoreFile {
    version: u32,
    entries: BTreeMap<String, Vec<u8>>,
}

/// JSON-file key-value store
///
/// The whole map lives in memory; every write rewrites the file through a
/// temporary sibling and a rename so a crash never leaves a torn file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FileStore {
    /// Open (or create) the store at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: StoreFile = serde_json::from_slice(&bytes)?;
                if file.version != FORMAT_VERSION {
                    return Err(StorageError::Corruption(format!(
                        "unsupported store version {} in {}",
                        file.version,
                        path.display()
                    )));
                }
                info!("Loaded {} entries from {}", file.entries.len(), path.display());
                file.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<(), StorageError> {
        let file = StoreFile {
            version: FORMAT_VERSION,
            entries: entries.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Flushed {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.flush(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.flush(&entries).await?;
        }
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("store.json");

        {
            let store = FileStore::open(&path).await.unwrap();
            store.put("peer/1", b"alice".to_vec()).await.unwrap();
            store.put("peer/2", b"bob".to_vec()).await.unwrap();
            store.delete("peer/2").await.unwrap();
        }

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(store.get("peer/1").await.unwrap(), Some(b"alice".to_vec()));
        assert_eq!(store.get("peer/2").await.unwrap(), None);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_scan() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("store.json")).await.unwrap();
        store.put("channel/x", vec![1]).await.unwrap();
        store.put("channelz", vec![9]).await.unwrap();
        store.put("channel/y", vec![2]).await.unwrap();
        store.put("peer/1", vec![3]).await.unwrap();

        let keys: Vec<String> = store
            .scan("channel/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["channel/x", "channel/y"]);
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        assert!(FileStore::open(&path).await.is_err());
    }
}
