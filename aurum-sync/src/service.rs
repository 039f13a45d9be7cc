use std::collections::HashMap;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use aurum_storage::ChainDisk;

use crate::types::{ChunkPriority, SnapshotManifest, SyncChunk, SyncError, SyncProgressRecord};

/// Default frame size for snapshot chunking: 1 MB.
pub const DEFAULT_CHUNK_SIZE: usize = 1_000_000;

/// Builds, stores, and serves snapshot chunks on the sender side, and
/// doubles as the receiver's local chunk store during a download.
pub struct ChunkedSyncService {
    disk: ChainDisk,
    chunk_size: usize,
}

impl ChunkedSyncService {
    pub fn new(disk: ChainDisk, chunk_size: usize) -> Self {
        Self {
            disk,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn with_default_chunk_size(disk: ChainDisk) -> Self {
        Self::new(disk, DEFAULT_CHUNK_SIZE)
    }

    /// Deterministically chunk a serialized state payload, checksum every
    /// frame, and persist the snapshot under a fresh id.
    ///
    /// The payload opens with the state index (headers, UTXO set), so the
    /// leading quarter of chunks is High priority; the trailing quarter is
    /// bulk history and goes Low.
    pub fn build_snapshot(&self, payload: &[u8], height: u64) -> Result<SnapshotManifest, SyncError> {
        let snapshot_id = Uuid::new_v4().to_string();
        let frames: Vec<&[u8]> = if payload.is_empty() {
            vec![&[]]
        } else {
            payload.chunks(self.chunk_size).collect()
        };
        let total_chunks = frames.len() as u32;

        let mut priority_map = HashMap::new();
        for (index, frame) in frames.iter().enumerate() {
            let index = index as u32;
            let priority = priority_for(index, total_chunks);
            priority_map.insert(index, priority);
            let chunk = SyncChunk {
                snapshot_id: snapshot_id.clone(),
                chunk_index: index,
                total_chunks,
                data: frame.to_vec(),
                checksum: aurum_crypto::sha256_hex(frame),
                compressed: false,
                priority,
            };
            self.store_chunk(&chunk)?;
        }

        let manifest = SnapshotManifest {
            snapshot_id: snapshot_id.clone(),
            height,
            total_chunks,
            total_size: payload.len() as u64,
            state_hash: aurum_crypto::sha256_hex(payload),
            priority_map,
            created_at: Utc::now(),
        };
        self.disk
            .write_json_atomic(&self.disk.snapshot_manifest_path(&snapshot_id), &manifest)?;
        info!(
            snapshot_id = %snapshot_id,
            height,
            chunks = total_chunks,
            bytes = payload.len(),
            "snapshot built"
        );
        Ok(manifest)
    }

    pub fn manifest(&self, snapshot_id: &str) -> Result<Option<SnapshotManifest>, SyncError> {
        Ok(self
            .disk
            .read_json(&self.disk.snapshot_manifest_path(snapshot_id))?)
    }

    /// Most recently created snapshot, if any.
    pub fn latest_manifest(&self) -> Result<Option<SnapshotManifest>, SyncError> {
        let mut latest: Option<SnapshotManifest> = None;
        for id in self.disk.snapshot_ids()? {
            if let Some(manifest) = self.manifest(&id)? {
                let newer = latest
                    .as_ref()
                    .map(|m| manifest.created_at > m.created_at)
                    .unwrap_or(true);
                if newer {
                    latest = Some(manifest);
                }
            }
        }
        Ok(latest)
    }

    pub fn store_chunk(&self, chunk: &SyncChunk) -> Result<(), SyncError> {
        let path = self
            .disk
            .snapshot_chunk_path(&chunk.snapshot_id, chunk.chunk_index);
        self.disk.write_bin_atomic(&path, chunk)?;
        Ok(())
    }

    pub fn chunk(&self, snapshot_id: &str, index: u32) -> Result<Option<SyncChunk>, SyncError> {
        Ok(self
            .disk
            .read_bin(&self.disk.snapshot_chunk_path(snapshot_id, index))?)
    }

    pub fn save_progress(&self, progress: &SyncProgressRecord) -> Result<(), SyncError> {
        self.disk.write_json_atomic(
            &self.disk.sync_progress_path(&progress.snapshot_id),
            progress,
        )?;
        Ok(())
    }

    pub fn load_progress(&self, snapshot_id: &str) -> Result<Option<SyncProgressRecord>, SyncError> {
        Ok(self.disk.read_json(&self.disk.sync_progress_path(snapshot_id))?)
    }

    pub fn delete_progress(&self, snapshot_id: &str) -> Result<(), SyncError> {
        self.disk.remove(&self.disk.sync_progress_path(snapshot_id))?;
        Ok(())
    }

    /// Reassemble all local chunks and verify the whole-payload hash;
    /// only a payload that matches the manifest is ever handed onward.
    pub fn verify_and_assemble(&self, manifest: &SnapshotManifest) -> Result<Vec<u8>, SyncError> {
        let mut payload = Vec::with_capacity(manifest.total_size as usize);
        let mut missing = 0usize;
        for index in 0..manifest.total_chunks {
            match self.chunk(&manifest.snapshot_id, index)? {
                Some(chunk) => {
                    if !chunk.verify_checksum() {
                        return Err(SyncError::ChecksumMismatch { index });
                    }
                    payload.extend_from_slice(&chunk.data);
                }
                None => missing += 1,
            }
        }
        if missing > 0 {
            return Err(SyncError::Incomplete { missing });
        }
        if aurum_crypto::sha256_hex(&payload) != manifest.state_hash {
            return Err(SyncError::StateHashMismatch);
        }
        Ok(payload)
    }
}

fn priority_for(index: u32, total: u32) -> ChunkPriority {
    if total <= 1 || index == 0 || (index as f64) < total as f64 * 0.25 {
        ChunkPriority::High
    } else if (index as f64) >= total as f64 * 0.75 {
        ChunkPriority::Low
    } else {
        ChunkPriority::Medium
    }
}
