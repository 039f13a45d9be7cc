use std::time::Duration;

use reqwest::blocking::Client;
use tracing::debug;

use crate::downloader::ChunkFetcher;
use crate::types::{ChunkPriority, SnapshotManifest, SyncChunk, SyncError};

/// Fetches manifests and chunks from a peer's HTTP sync surface.
///
/// Chunk bodies travel raw; integrity metadata rides in the
/// `X-Chunk-Checksum` / `X-Total-Chunks` headers, and partially received
/// chunks are completed with a `Range` request instead of refetching.
pub struct HttpChunkFetcher {
    base_url: String,
    client: Client,
}

impl HttpChunkFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Fetch(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn header<'a>(response: &'a reqwest::blocking::Response, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// Resume a partially received chunk body from `offset`.
    pub fn fetch_chunk_tail(
        &self,
        snapshot_id: &str,
        index: u32,
        offset: u64,
    ) -> Result<Vec<u8>, SyncError> {
        let url = format!("{}/sync/snapshot/{snapshot_id}/chunk/{index}", self.base_url);
        let response = self
            .client
            .get(url)
            .header("Range", format!("bytes={offset}-"))
            .send()
            .map_err(|e| SyncError::Fetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SyncError::Fetch(format!(
                "chunk {index} range request returned {}",
                response.status()
            )));
        }
        let body = response.bytes().map_err(|e| SyncError::Fetch(e.to_string()))?;
        Ok(body.to_vec())
    }
}

impl ChunkFetcher for HttpChunkFetcher {
    fn fetch_latest_manifest(&self) -> Result<SnapshotManifest, SyncError> {
        let url = format!("{}/sync/snapshot/latest", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| SyncError::Fetch(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound("latest snapshot".into()));
        }
        if !response.status().is_success() {
            return Err(SyncError::Fetch(format!(
                "manifest request returned {}",
                response.status()
            )));
        }
        response
            .json::<SnapshotManifest>()
            .map_err(|e| SyncError::Fetch(e.to_string()))
    }

    fn fetch_chunk(&self, snapshot_id: &str, index: u32) -> Result<SyncChunk, SyncError> {
        let url = format!("{}/sync/snapshot/{snapshot_id}/chunk/{index}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| SyncError::Fetch(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(format!("chunk {index}")));
        }
        if !response.status().is_success() {
            return Err(SyncError::Fetch(format!(
                "chunk {index} request returned {}",
                response.status()
            )));
        }

        let checksum = Self::header(&response, "x-chunk-checksum")
            .unwrap_or_default()
            .to_string();
        let total_chunks: u32 = Self::header(&response, "x-total-chunks")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let compressed = Self::header(&response, "x-compressed") == Some("true");
        let priority = match Self::header(&response, "x-chunk-priority") {
            Some("high") => ChunkPriority::High,
            Some("low") => ChunkPriority::Low,
            _ => ChunkPriority::Medium,
        };
        let data = response
            .bytes()
            .map_err(|e| SyncError::Fetch(e.to_string()))?
            .to_vec();
        debug!(snapshot_id, index, bytes = data.len(), "chunk fetched");

        Ok(SyncChunk {
            snapshot_id: snapshot_id.to_string(),
            chunk_index: index,
            total_chunks,
            data,
            checksum,
            compressed,
            priority,
        })
    }
}
