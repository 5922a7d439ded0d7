//! Queue-backed workers, one per background concern

pub mod cache;
pub mod cover;
pub mod download;

pub use cache::{CacheEvent, CacheRequest, CacheWorker};
pub use cover::{CoverEvent, CoverRequest, CoverWorker};
pub use download::{DownloadEvent, DownloadRequest, DownloadWorker};
