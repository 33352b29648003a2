use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use putio_core::{File, PutioClient, PutioError, ROOT_FOLDER_ID};
use thiserror::Error;
use tracing::{debug, warn};

use crate::downloads::{DownloadEngine, EngineError, Fetcher};
use crate::paths::local_component;
use crate::registry::{ProcessedRegistry, RegistryError};

const LIST_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("api error: {0}")]
    Api(#[from] PutioError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("enqueue failed: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub enqueued: usize,
    pub skipped: usize,
    /// Remote items whose name cannot be used as a local file name.
    pub unusable: usize,
}

/// Walks the remote tree and queues every file that was not handled before.
pub struct Scanner<F = crate::downloads::ChunkedFetcher> {
    client: PutioClient,
    registry: Arc<ProcessedRegistry>,
    engine: Arc<DownloadEngine<F>>,
}

impl<F: Fetcher> Scanner<F> {
    pub fn new(
        client: PutioClient,
        registry: Arc<ProcessedRegistry>,
        engine: Arc<DownloadEngine<F>>,
    ) -> Self {
        Self {
            client,
            registry,
            engine,
        }
    }

    /// Scans the account root into `out_root`. An item is registered only
    /// after it, and for folders every child, was queued successfully, so a
    /// failed scan is picked up again by the next one.
    pub async fn scan(&self, out_root: &Path) -> Result<ScanSummary, ScanError> {
        let mut summary = ScanSummary::default();
        self.scan_folder(ROOT_FOLDER_ID, out_root.to_path_buf(), &mut summary)
            .await?;
        Ok(summary)
    }

    fn scan_folder<'a>(
        &'a self,
        folder_id: i64,
        out_dir: PathBuf,
        summary: &'a mut ScanSummary,
    ) -> BoxFuture<'a, Result<(), ScanError>> {
        async move {
            let files = self.client.list_folder_all(folder_id, LIST_PAGE_SIZE).await?;
            for file in &files {
                self.scan_entry(file, &out_dir, summary).await?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn scan_entry(
        &self,
        file: &File,
        out_dir: &Path,
        summary: &mut ScanSummary,
    ) -> Result<(), ScanError> {
        let key = registry_key(file);
        if self.registry.is_registered(&key).await {
            summary.skipped += 1;
            return Ok(());
        }

        let local = match local_component(&file.name) {
            Ok(component) => out_dir.join(component),
            Err(err) => {
                warn!(id = file.id, name = %file.name, error = %err, "skipping remote item");
                summary.unusable += 1;
                return Ok(());
            }
        };
        if file.is_dir() {
            self.scan_folder(file.id, local, summary).await?;
        } else {
            let url = self.client.get_download_url(file.id).await?;
            if self.engine.enqueue(url.as_str(), &local).await? {
                debug!(destination = %local.display(), "queued download");
                summary.enqueued += 1;
            }
        }

        self.registry.register(key).await?;
        Ok(())
    }
}

/// Identity of a remote item for the processed registry. A re-uploaded or
/// modified item gets a new key and is fetched again.
pub fn registry_key(file: &File) -> String {
    format!(
        "{}{}{}",
        file.name,
        file.created_at.as_deref().unwrap_or_default(),
        file.updated_at.as_deref().unwrap_or_default()
    )
}
