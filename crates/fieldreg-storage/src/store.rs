//! Async key-value stores. The file store is the on-device source of truth.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding value for key `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding value for key `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let text = serde_json::to_string(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })?;
    store.set(key, &text).await
}

/// One JSON file per key, hash-addressed, written via temp file + atomic rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.json", Self::sha256_hex(key.as_bytes())))
    }
}

fn io_error(action: &'static str, path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error("reading", &path, err)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| io_error("creating store directory", &self.root, err))?;

        let path = self.path_for(key);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), value.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| io_error("opening temp file", &temp_path, err))?;
        let written = async {
            file.write_all(value.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error("writing temp file", &temp_path, err));
        }

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error("atomically renaming into", &path, err));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error("removing", &path, err)),
        }
    }
}

/// Process-lifetime store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn key_hashing_is_stable() {
        let hash = FileStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn file_store_round_trips_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("kv"));

        assert_eq!(store.get("sync_queue:items").await.expect("get"), None);

        store.set("sync_queue:items", "[1]").await.expect("first set");
        store.set("sync_queue:items", "[1,2]").await.expect("second set");
        assert_eq!(
            store.get("sync_queue:items").await.expect("get"),
            Some("[1,2]".to_string())
        );
        assert!(store.path_for("sync_queue:items").exists());

        let leftovers = std::fs::read_dir(store.root())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let store = FileStore::new(dir.path());
            store.set("assessment:p-1", "{}").await.expect("set");
        }
        let reopened = FileStore::new(dir.path());
        assert_eq!(
            reopened.get("assessment:p-1").await.expect("get"),
            Some("{}".to_string())
        );
    }

    #[tokio::test]
    async fn removing_missing_key_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        store.remove("nope").await.expect("remove missing");
    }

    #[tokio::test]
    async fn json_helpers_report_decode_errors_with_key() {
        let store = MemoryStore::new();
        let sample = Sample {
            name: "queue".into(),
            count: 2,
        };
        save_json(&store, "k", &sample).await.expect("save");
        let loaded: Option<Sample> = load_json(&store, "k").await.expect("load");
        assert_eq!(loaded, Some(sample));

        store.set("bad", "{not json").await.expect("set");
        let err = load_json::<Sample>(&store, "bad").await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { ref key, .. } if key == "bad"));
    }
}
