use std::future::Future;
use std::io;
use std::num::NonZeroU64;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::store::DownloadRequest;
use crate::persist::sibling_path;

pub const DEFAULT_CHUNK_SIZE: NonZeroU64 = match NonZeroU64::new(5 * 1024 * 1024) {
    Some(size) => size,
    None => unreachable!(),
};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cannot prepare destination: {0}")]
    Persist(io::Error),
    #[error("writing chunk failed: {0}")]
    Write(io::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server does not support range requests: {url}")]
    RangesUnsupported { url: String },
    #[error("server did not report a content length: {url}")]
    MissingContentLength { url: String },
    #[error("unexpected status {status} for {range}")]
    Status { status: StatusCode, range: String },
    #[error("{range} returned {received} bytes, expected {expected}")]
    ChunkLength {
        range: String,
        expected: u64,
        received: u64,
    },
    #[error("transfer cancelled")]
    Cancelled,
}

impl FetchError {
    /// True when the source can never be fetched chunk-wise as served.
    pub fn is_capability(&self) -> bool {
        matches!(
            self,
            FetchError::RangesUnsupported { .. } | FetchError::MissingContentLength { .. }
        )
    }

    /// True when the local destination could not be created or finalized.
    pub fn is_persistence(&self) -> bool {
        matches!(self, FetchError::Persist(_))
    }
}

/// Inclusive byte span `start..=end` of one chunk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Iterator over the contiguous ranges that tile `[0, total_len)`.
#[derive(Debug, Clone)]
pub struct ChunkRanges {
    next: u64,
    total_len: u64,
    chunk_size: u64,
}

pub fn chunk_ranges(total_len: u64, chunk_size: NonZeroU64) -> ChunkRanges {
    ChunkRanges {
        next: 0,
        total_len,
        chunk_size: chunk_size.get(),
    }
}

impl Iterator for ChunkRanges {
    type Item = ByteRange;

    fn next(&mut self) -> Option<ByteRange> {
        if self.next >= self.total_len {
            return None;
        }
        let start = self.next;
        let end = start
            .saturating_add(self.chunk_size - 1)
            .min(self.total_len - 1);
        self.next = end + 1;
        Some(ByteRange { start, end })
    }
}

/// Executes one download request to completion or failure.
pub trait Fetcher: Clone + Send + Sync + 'static {
    fn fetch(
        &self,
        request: DownloadRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), FetchError>> + Send;
}

/// Downloads a file as a sequence of range-restricted GETs.
///
/// The body is streamed into `<destination>.partial` and renamed onto the
/// destination once every chunk arrived, so the destination never holds a
/// half-written file. A failed attempt leaves the `.partial` file behind; the
/// next attempt truncates it.
#[derive(Clone)]
pub struct ChunkedFetcher {
    http: Client,
    chunk_size: NonZeroU64,
}

impl ChunkedFetcher {
    pub fn new(chunk_size: NonZeroU64) -> Self {
        Self::with_http(Client::new(), chunk_size)
    }

    pub fn with_http(http: Client, chunk_size: NonZeroU64) -> Self {
        Self { http, chunk_size }
    }

    pub fn chunk_size(&self) -> NonZeroU64 {
        self.chunk_size
    }

    /// Downloads `request` and returns the number of bytes written.
    pub async fn download(&self, request: &DownloadRequest) -> Result<u64, FetchError> {
        let url = Url::parse(&request.source_url)?;
        let target = request.destination.as_path();

        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(FetchError::Persist)?;
        }
        let partial = sibling_path(target, "partial");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(FetchError::Persist)?;

        let total_len = self.probe(&url).await?;
        debug!(url = %url, total_len, "probe accepted");

        let mut written = 0u64;
        for range in chunk_ranges(total_len, self.chunk_size) {
            written += self.fetch_chunk(&url, range, total_len, &mut file).await?;
        }

        file.flush().await.map_err(FetchError::Persist)?;
        file.sync_all().await.map_err(FetchError::Persist)?;
        drop(file);
        tokio::fs::rename(&partial, target)
            .await
            .map_err(FetchError::Persist)?;
        Ok(written)
    }

    async fn probe(&self, url: &Url) -> Result<u64, FetchError> {
        let response = self
            .http
            .head(url.clone())
            .send()
            .await?
            .error_for_status()?;
        let headers = response.headers();

        let ranges_supported = headers
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("bytes"));
        if !ranges_supported {
            return Err(FetchError::RangesUnsupported {
                url: url.to_string(),
            });
        }

        headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| FetchError::MissingContentLength {
                url: url.to_string(),
            })
    }

    async fn fetch_chunk(
        &self,
        url: &Url,
        range: ByteRange,
        total_len: u64,
        file: &mut tokio::fs::File,
    ) -> Result<u64, FetchError> {
        let header = range.header_value();
        let response = self
            .http
            .get(url.clone())
            .header(RANGE, &header)
            .send()
            .await?;

        let status = response.status();
        let covers_whole_file = range.start == 0 && range.len() == total_len;
        if status != StatusCode::PARTIAL_CONTENT && !(status == StatusCode::OK && covers_whole_file)
        {
            return Err(FetchError::Status {
                status,
                range: header,
            });
        }

        let expected = range.len();
        let mut received = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(bytes) = stream.next().await {
            let bytes = bytes?;
            received += bytes.len() as u64;
            if received > expected {
                return Err(FetchError::ChunkLength {
                    range: header,
                    expected,
                    received,
                });
            }
            file.write_all(&bytes).await.map_err(FetchError::Write)?;
        }
        if received != expected {
            return Err(FetchError::ChunkLength {
                range: header,
                expected,
                received,
            });
        }
        Ok(received)
    }
}

impl Default for ChunkedFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl Fetcher for ChunkedFetcher {
    async fn fetch(
        &self,
        request: DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<(), FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.download(&request) => result.map(|_| ()),
        }
    }
}
