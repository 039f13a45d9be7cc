use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] aurum_storage::StorageError),
    #[error("network fetch failed: {0}")]
    Fetch(String),
    #[error("chunk {index} checksum mismatch")]
    ChecksumMismatch { index: u32 },
    #[error("reassembled payload does not hash to the manifest state hash")]
    StateHashMismatch,
    #[error("download incomplete: {missing} chunks still outstanding")]
    Incomplete { missing: usize },
    #[error("snapshot {0} not found")]
    NotFound(String),
    #[error("sync cancelled")]
    Cancelled,
}

/// Download ordering class. High chunks carry the state the receiver
/// needs first (headers, UTXO index); Low chunks are bulk history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_id: String,
    pub height: u64,
    pub total_chunks: u32,
    pub total_size: u64,
    /// SHA-256 over the whole serialized payload.
    pub state_hash: String,
    pub priority_map: HashMap<u32, ChunkPriority>,
    pub created_at: DateTime<Utc>,
}

impl SnapshotManifest {
    pub fn priority_of(&self, index: u32) -> ChunkPriority {
        self.priority_map
            .get(&index)
            .copied()
            .unwrap_or(ChunkPriority::Medium)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChunk {
    pub snapshot_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub data: Vec<u8>,
    /// SHA-256 over `data`.
    pub checksum: String,
    pub compressed: bool,
    pub priority: ChunkPriority,
}

impl SyncChunk {
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn verify_checksum(&self) -> bool {
        aurum_crypto::sha256_hex(&self.data) == self.checksum
    }
}

/// Resumable download bookkeeping, persisted after every update batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgressRecord {
    pub snapshot_id: String,
    pub total_chunks: u32,
    pub downloaded_chunks: BTreeSet<u32>,
    pub failed_chunks: BTreeSet<u32>,
    pub started_at: DateTime<Utc>,
    pub last_chunk_at: Option<DateTime<Utc>>,
}

impl SyncProgressRecord {
    pub fn new(snapshot_id: String, total_chunks: u32) -> Self {
        Self {
            snapshot_id,
            total_chunks,
            downloaded_chunks: BTreeSet::new(),
            failed_chunks: BTreeSet::new(),
            started_at: Utc::now(),
            last_chunk_at: None,
        }
    }

    pub fn mark_downloaded(&mut self, index: u32) {
        self.downloaded_chunks.insert(index);
        self.failed_chunks.remove(&index);
        self.last_chunk_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, index: u32) {
        if !self.downloaded_chunks.contains(&index) {
            self.failed_chunks.insert(index);
        }
    }

    pub fn remaining_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.downloaded_chunks.contains(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded_chunks.len() as u32 == self.total_chunks
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        self.downloaded_chunks.len() as f64 / self.total_chunks as f64 * 100.0
    }
}
