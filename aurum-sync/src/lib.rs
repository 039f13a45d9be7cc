pub mod downloader;
pub mod http;
pub mod service;
pub mod throttle;
pub mod types;

pub use downloader::{ChunkFetcher, DownloadState, SyncDownloader, SyncDownloaderConfig};
pub use http::HttpChunkFetcher;
pub use service::ChunkedSyncService;
pub use throttle::BandwidthThrottle;
pub use types::{ChunkPriority, SnapshotManifest, SyncChunk, SyncError, SyncProgressRecord};
