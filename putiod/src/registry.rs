use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::persist::write_atomic;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("registry document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Persisted set of keys for remote items that were already handled.
///
/// Stored as a JSON object mapping each key to `true`. Every `register`
/// rewrites the document before returning.
#[derive(Debug)]
pub struct ProcessedRegistry {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, bool>>,
}

impl ProcessedRegistry {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_registered(&self, key: &str) -> bool {
        self.entries.lock().await.get(key).copied().unwrap_or(false)
    }

    pub async fn register(&self, key: impl Into<String>) -> Result<(), RegistryError> {
        let key = key.into();
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(key.clone(), true);
        if let Err(err) = persist(&self.path, &entries).await {
            match previous {
                Some(value) => entries.insert(key, value),
                None => entries.remove(&key),
            };
            return Err(err);
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.values().filter(|v| **v).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn persist(path: &Path, entries: &BTreeMap<String, bool>) -> Result<(), RegistryError> {
    let data = serde_json::to_vec(entries)?;
    write_atomic(path, &data).await?;
    Ok(())
}
