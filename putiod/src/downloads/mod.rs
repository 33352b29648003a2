pub mod engine;
pub mod fetcher;
pub mod store;

pub use engine::{CycleReport, DEFAULT_MAX_CONCURRENT, DownloadEngine, EngineError, FailedDownload};
pub use fetcher::{ChunkedFetcher, DEFAULT_CHUNK_SIZE, FetchError, Fetcher};
pub use store::{DownloadRequest, RequestStore, StoreError};
