//! Generic persisted key-value interface (spec.md §6 "Persisted state
//! layout") and two concrete implementations used to back the CLI binary:
//! an in-memory store for tests and a file-per-key store on disk.
//!
//! Component-specific repositories (`SecureIdentityStore`, `PeerRepository`,
//! `SubscriptionRepository`) are declared next to the component that owns
//! their contract (`identity`, `trust_store`, `subscription` respectively)
//! but several of this crate's reference implementations are built on top
//! of the generic store defined here, mirroring spec.md's description of
//! the persisted layout as one opaque key-value interface reused across
//! stores.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;

use crate::error::CribCallError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CribCallError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CribCallError>;
    async fn delete(&self, key: &str) -> Result<(), CribCallError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, CribCallError>;
}

/// In-memory store. Used by tests and by the CLI's ephemeral modes.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CribCallError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CribCallError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CribCallError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, CribCallError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// File-per-key store rooted at a directory. Writes are atomic
/// (write-to-temp-then-rename) as spec.md §6 requires for identity and
/// trust-store persistence.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.replace('/', "_"))
    }

    async fn atomic_write(path: &PathBuf, value: &[u8]) -> Result<(), CribCallError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value)
            .await
            .map_err(|e| CribCallError::RepositoryUnavailable(e.to_string()))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| CribCallError::RepositoryUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CribCallError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CribCallError::RepositoryUnavailable(e.to_string())),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CribCallError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CribCallError::RepositoryUnavailable(e.to_string()))?;
        Self::atomic_write(&self.path_for(key), value).await
    }

    async fn delete(&self, key: &str) -> Result<(), CribCallError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CribCallError::RepositoryUnavailable(e.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, CribCallError> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(CribCallError::RepositoryUnavailable(e.to_string())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CribCallError::RepositoryUnavailable(e.to_string()))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }
}
