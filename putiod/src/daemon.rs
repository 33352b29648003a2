use std::fmt;
use std::future::Future;
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use putio_core::{DEFAULT_BASE_URL, PutioClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::downloads::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT, DownloadEngine, EngineError, RequestStore,
};
use crate::registry::ProcessedRegistry;
use crate::scanner::Scanner;

const DEFAULT_OUT_DIR_NAME: &str = "Downloads";
const DEFAULT_REFRESH_SECS: u64 = 30;

#[derive(Debug, Clone, Parser)]
#[command(name = "putiod", version, about = "Mirrors a put.io account onto local disk")]
pub struct DaemonArgs {
    /// OAuth token of the put.io account.
    #[arg(long, env = "PUTIO_TOKEN", hide_env_values = true)]
    pub putio_token: String,

    /// Directory the account is mirrored into [default: ./Downloads]
    #[arg(long = "out", env = "PUTIO_OUT_DIR", value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// File recording remote items that were already handled.
    #[arg(
        long = "registry",
        env = "PUTIO_REGISTRY_PATH",
        default_value = ".registry",
        value_name = "FILE"
    )]
    pub registry_path: PathBuf,

    /// File holding the pending download requests.
    #[arg(
        long = "requests",
        env = "PUTIO_REQUESTS_PATH",
        default_value = ".requests",
        value_name = "FILE"
    )]
    pub requests_path: PathBuf,

    /// Seconds between account scans and between download cycles.
    #[arg(
        long,
        env = "PUTIO_REFRESH_SECS",
        default_value_t = DEFAULT_REFRESH_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub refresh_rate: u64,

    /// Bytes requested per range request.
    #[arg(
        long,
        env = "PUTIO_CHUNK_SIZE",
        default_value_t = DEFAULT_CHUNK_SIZE.get(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub chunk_size: u64,

    /// Files downloaded at the same time.
    #[arg(
        long,
        env = "PUTIO_MAX_CONCURRENT",
        default_value_t = DEFAULT_MAX_CONCURRENT as u32,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_concurrent: u32,

    #[arg(long, env = "PUTIO_API_URL", default_value = DEFAULT_BASE_URL, hide = true)]
    pub api_url: String,
}

impl DaemonArgs {
    pub fn into_config(self) -> anyhow::Result<DaemonConfig> {
        anyhow::ensure!(
            !self.putio_token.trim().is_empty(),
            "put.io token must not be empty"
        );
        let output_dir = match self.out_dir {
            Some(dir) => dir,
            None => std::env::current_dir()
                .context("current directory is unavailable")?
                .join(DEFAULT_OUT_DIR_NAME),
        };
        anyhow::ensure!(self.refresh_rate > 0, "refresh rate must be positive");
        let chunk_size = NonZeroU64::new(self.chunk_size).context("chunk size must be positive")?;
        anyhow::ensure!(
            self.max_concurrent > 0,
            "concurrent download limit must be positive"
        );

        Ok(DaemonConfig {
            token: self.putio_token,
            api_url: self.api_url,
            output_dir,
            registry_path: self.registry_path,
            requests_path: self.requests_path,
            refresh_interval: Duration::from_secs(self.refresh_rate),
            chunk_size,
            max_concurrent: self.max_concurrent as usize,
        })
    }
}

#[derive(Clone)]
pub struct DaemonConfig {
    pub token: String,
    pub api_url: String,
    pub output_dir: PathBuf,
    pub registry_path: PathBuf,
    pub requests_path: PathBuf,
    pub refresh_interval: Duration,
    pub chunk_size: NonZeroU64,
    pub max_concurrent: usize,
}

impl fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("api_url", &self.api_url)
            .field("output_dir", &self.output_dir)
            .field("registry_path", &self.registry_path)
            .field("requests_path", &self.requests_path)
            .field("refresh_interval", &self.refresh_interval)
            .field("chunk_size", &self.chunk_size)
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<DownloadEngine>,
    scanner: Arc<Scanner>,
    shutdown: CancellationToken,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create output directory {}",
                    config.output_dir.display()
                )
            })?;

        let client = PutioClient::with_base_url(&config.api_url, config.token.clone())
            .context("invalid put.io api url")?;
        let registry = ProcessedRegistry::open(&config.registry_path)
            .await
            .with_context(|| {
                format!(
                    "failed to load registry {}",
                    config.registry_path.display()
                )
            })?;
        let store = Arc::new(RequestStore::new(&config.requests_path));
        let pending = store.snapshot().await.with_context(|| {
            format!(
                "failed to load pending requests {}",
                config.requests_path.display()
            )
        })?;

        let shutdown = CancellationToken::new();
        let engine = Arc::new(
            DownloadEngine::new(store, config.max_concurrent, config.chunk_size)
                .with_cancellation(shutdown.child_token()),
        );
        let registered = registry.len().await;
        let scanner = Arc::new(Scanner::new(
            client,
            Arc::new(registry),
            Arc::clone(&engine),
        ));

        info!(
            output_dir = %config.output_dir.display(),
            pending = pending.len(),
            registered,
            "daemon ready"
        );

        Ok(Self {
            config,
            engine,
            scanner,
            shutdown,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<DownloadEngine> {
        &self.engine
    }

    /// Runs until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c()
                .await
                .context("failed waiting for shutdown signal")
        })
        .await
    }

    /// Runs the scan and download loops until `signal` resolves, then cancels
    /// in-flight transfers and waits for both loops to stop.
    pub async fn run_until<S>(self, signal: S) -> anyhow::Result<()>
    where
        S: Future<Output = anyhow::Result<()>>,
    {
        let interval = self.config.refresh_interval;
        info!(
            refresh_secs = interval.as_secs(),
            max_concurrent = self.engine.max_concurrent(),
            "starting loops"
        );

        let scan_handle = tokio::spawn(scan_loop(
            Arc::clone(&self.scanner),
            self.config.output_dir.clone(),
            interval,
            self.shutdown.clone(),
        ));
        let download_handle = tokio::spawn(download_loop(
            Arc::clone(&self.engine),
            interval,
            self.shutdown.clone(),
        ));

        let outcome = signal.await;
        info!("shutting down");
        self.shutdown.cancel();

        let (scan, download) = tokio::join!(scan_handle, download_handle);
        scan.context("scan loop panicked")?;
        download.context("download loop panicked")?;
        outcome
    }
}

async fn scan_loop(
    scanner: Arc<Scanner>,
    out_dir: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = scanner.scan(&out_dir) => match result {
                Ok(summary) if summary.enqueued > 0 => {
                    info!(
                        enqueued = summary.enqueued,
                        skipped = summary.skipped,
                        unusable = summary.unusable,
                        "scan queued new downloads"
                    );
                }
                Ok(_) => debug!("scan found nothing new"),
                Err(err) => error!(error = %err, "scan failed"),
            },
        }
        if !wait_next_tick(interval, &shutdown).await {
            break;
        }
    }
    debug!("scan loop stopped");
}

async fn download_loop(engine: Arc<DownloadEngine>, interval: Duration, shutdown: CancellationToken) {
    while !shutdown.is_cancelled() {
        match engine.run_cycle().await {
            Ok(report) if report.attempted > 0 => {
                info!(completed = report.completed, "download cycle finished");
            }
            Ok(_) => {}
            Err(EngineError::Cycle {
                attempted,
                failures,
            }) => {
                warn!(
                    attempted,
                    failed = failures.len(),
                    "download cycle finished with failures"
                );
            }
            Err(err) => error!(error = %err, "download cycle failed"),
        }
        if !wait_next_tick(interval, &shutdown).await {
            break;
        }
    }
    debug!("download loop stopped");
}

/// Sleeps for `interval`. Returns `false` when shutdown was requested first.
async fn wait_next_tick(interval: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
