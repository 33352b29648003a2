use std::num::NonZeroU64;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::fetcher::{ChunkedFetcher, FetchError, Fetcher};
use super::store::{DownloadRequest, RequestStore, StoreError};

pub const DEFAULT_MAX_CONCURRENT: usize = 3;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("source url must not be empty")]
    EmptySource,
    #[error("destination path must not be empty")]
    EmptyDestination,
    #[error("request store error: {0}")]
    Store(#[from] StoreError),
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("download task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("{} of {attempted} downloads failed", .failures.len())]
    Cycle {
        attempted: usize,
        failures: Vec<FailedDownload>,
    },
}

#[derive(Debug)]
pub struct FailedDownload {
    pub request: DownloadRequest,
    pub error: EngineError,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub attempted: usize,
    pub completed: usize,
}

/// Drains the request store through a bounded pool of fetchers.
///
/// Requests stay in the store until their transfer succeeded, so a crash or a
/// failed attempt leaves them queued for the next cycle. There is no retry cap:
/// a request that can never succeed is attempted on every cycle until it is
/// removed from the store by hand.
pub struct DownloadEngine<F = ChunkedFetcher> {
    store: Arc<RequestStore>,
    fetcher: F,
    max_concurrent: usize,
    drain: Mutex<()>,
    cancel: CancellationToken,
}

impl DownloadEngine<ChunkedFetcher> {
    pub fn new(store: Arc<RequestStore>, max_concurrent: usize, chunk_size: NonZeroU64) -> Self {
        Self::with_fetcher(store, ChunkedFetcher::new(chunk_size), max_concurrent)
    }
}

impl<F: Fetcher> DownloadEngine<F> {
    pub fn with_fetcher(store: Arc<RequestStore>, fetcher: F, max_concurrent: usize) -> Self {
        Self {
            store,
            fetcher,
            max_concurrent: max_concurrent.max(1),
            drain: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// Runs every transfer under `cancel`; cancelling it aborts in-flight
    /// downloads and leaves their requests queued.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<RequestStore> {
        &self.store
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn cancel_all_transfers(&self) {
        self.cancel.cancel();
    }

    pub async fn pending(&self) -> Result<Vec<DownloadRequest>, EngineError> {
        Ok(self.store.snapshot().await?)
    }

    /// Records a download request. Returns `false` when an identical request
    /// is already pending.
    pub async fn enqueue(
        &self,
        source_url: &str,
        destination: impl AsRef<Path>,
    ) -> Result<bool, EngineError> {
        if source_url.trim().is_empty() {
            return Err(EngineError::EmptySource);
        }
        let destination = destination.as_ref();
        if destination.as_os_str().is_empty() {
            return Err(EngineError::EmptyDestination);
        }
        let request = DownloadRequest::new(source_url, destination);
        Ok(self.store.append_unique(request).await?)
    }

    /// Attempts every pending request once.
    ///
    /// Cycles never overlap. Each finished transfer removes its own request
    /// right away; failures are collected and returned together after every
    /// request had its attempt.
    pub async fn run_cycle(&self) -> Result<CycleReport, EngineError> {
        let _drain = self.drain.lock().await;
        let pending = self.store.snapshot().await?;
        if pending.is_empty() {
            return Ok(CycleReport::default());
        }

        let attempted = pending.len();
        let limit = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(attempted);
        for request in pending {
            let task = attempt(
                self.fetcher.clone(),
                Arc::clone(&self.store),
                Arc::clone(&limit),
                request.clone(),
                self.cancel.clone(),
            );
            handles.push((request, tokio::spawn(task)));
        }

        let mut failures = Vec::new();
        for (request, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(err) => Err(EngineError::Task(err)),
            };
            if let Err(error) = outcome {
                warn!(request = %request, error = %error, "download failed");
                failures.push(FailedDownload { request, error });
            }
        }

        if failures.is_empty() {
            Ok(CycleReport {
                attempted,
                completed: attempted,
            })
        } else {
            Err(EngineError::Cycle {
                attempted,
                failures,
            })
        }
    }
}

async fn attempt<F: Fetcher>(
    fetcher: F,
    store: Arc<RequestStore>,
    limit: Arc<Semaphore>,
    request: DownloadRequest,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let _permit = limit
        .acquire_owned()
        .await
        .map_err(|_| EngineError::ConcurrencyClosed)?;
    info!(destination = %request.destination.display(), "downloading");
    fetcher.fetch(request.clone(), cancel).await?;
    store.remove(&request).await?;
    info!(destination = %request.destination.display(), "downloaded");
    Ok(())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
