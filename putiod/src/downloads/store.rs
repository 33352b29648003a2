use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::persist::write_atomic;

/// One pending transfer: where to fetch from and where the file lands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadRequest {
    #[serde(rename = "downloadUrl")]
    pub source_url: String,
    #[serde(rename = "downloadPath")]
    pub destination: PathBuf,
}

impl DownloadRequest {
    pub fn new(source_url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            destination: destination.into(),
        }
    }
}

impl fmt::Display for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source_url, self.destination.display())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("request store document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no pending request for {0}")]
    NotFound(DownloadRequest),
}

impl StoreError {
    /// True when the backing document could not be read, parsed or written.
    pub fn is_persistence(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Malformed(_))
    }
}

/// Durable, ordered list of pending download requests backed by one JSON file.
///
/// Every operation reads the whole document, changes it in memory and writes
/// it back while holding `lock`, so appends from the scanner and removals from
/// finished transfers never lose each other's updates. The lock only covers
/// document I/O.
#[derive(Debug)]
pub struct RequestStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RequestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, request: DownloadRequest) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut requests = read_document(&self.path).await?;
        requests.push(request);
        write_document(&self.path, &requests).await
    }

    /// Appends `request` unless an equal entry is already pending.
    /// Returns `true` when the request was recorded.
    pub async fn append_unique(&self, request: DownloadRequest) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut requests = read_document(&self.path).await?;
        if requests.contains(&request) {
            return Ok(false);
        }
        requests.push(request);
        write_document(&self.path, &requests).await?;
        Ok(true)
    }

    /// Removes the first entry equal to `request`.
    pub async fn remove(&self, request: &DownloadRequest) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut requests = read_document(&self.path).await?;
        let Some(index) = requests.iter().position(|existing| existing == request) else {
            return Err(StoreError::NotFound(request.clone()));
        };
        requests.remove(index);
        write_document(&self.path, &requests).await
    }

    pub async fn snapshot(&self) -> Result<Vec<DownloadRequest>, StoreError> {
        let _guard = self.lock.lock().await;
        read_document(&self.path).await
    }
}

async fn read_document(path: &Path) -> Result<Vec<DownloadRequest>, StoreError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_slice(&data)?)
}

async fn write_document(path: &Path, requests: &[DownloadRequest]) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(requests)?;
    write_atomic(path, &data).await?;
    Ok(())
}
