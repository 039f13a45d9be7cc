use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt state file {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

/// On-disk layout rooted at the node's data directory.
///
/// Every write goes through write-tmp + rename so a crash can never leave a
/// half-written consensus file behind; a file either has its old content or
/// its new content. The disk is the source of truth; all in-memory indices
/// are reconstructable from it.
#[derive(Debug, Clone)]
pub struct ChainDisk {
    root: PathBuf,
}

impl ChainDisk {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        for sub in ["blocks", "utxo", "checkpoints", "snapshots", "sync"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // Path layout -----------------------------------------------------

    pub fn genesis_path(&self) -> PathBuf {
        self.root.join("genesis.json")
    }

    pub fn block_path(&self, index: u64) -> PathBuf {
        self.root.join("blocks").join(format!("block_{index}.json"))
    }

    pub fn utxo_index_path(&self) -> PathBuf {
        self.root.join("utxo").join("index.bin")
    }

    pub fn checkpoint_path(&self, height: u64) -> PathBuf {
        self.root
            .join("checkpoints")
            .join(format!("cp_{height}.json"))
    }

    pub fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.root.join("snapshots").join(snapshot_id)
    }

    pub fn snapshot_manifest_path(&self, snapshot_id: &str) -> PathBuf {
        self.snapshot_dir(snapshot_id).join("manifest.json")
    }

    pub fn snapshot_chunk_path(&self, snapshot_id: &str, index: u32) -> PathBuf {
        self.snapshot_dir(snapshot_id).join(format!("chunk_{index}.bin"))
    }

    pub fn sync_progress_path(&self, snapshot_id: &str) -> PathBuf {
        self.root.join("sync").join(format!("progress_{snapshot_id}.json"))
    }

    // Atomic primitives ----------------------------------------------

    /// Write bytes via a temp file in the same directory, then rename.
    pub fn write_bytes_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), bytes = bytes.len(), "state file written");
        Ok(())
    }

    pub fn write_json_atomic<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StorageError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.write_bytes_atomic(path, &bytes)
    }

    pub fn write_bin_atomic<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = bincode::serialize(value).map_err(|e| StorageError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.write_bytes_atomic(path, &bytes)
    }

    pub fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and parse a JSON state file. A present-but-unparsable file is
    /// corruption, not absence.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StorageError> {
        let Some(bytes) = self.read_bytes(path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    pub fn read_bin<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StorageError> {
        let Some(bytes) = self.read_bytes(path)? else {
            return Ok(None);
        };
        bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    pub fn remove(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Checkpoint heights present on disk, ascending.
    pub fn checkpoint_heights(&self) -> Result<Vec<u64>, StorageError> {
        let mut heights = Vec::new();
        for entry in fs::read_dir(self.root.join("checkpoints"))? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(h) = name
                .strip_prefix("cp_")
                .and_then(|s| s.strip_suffix(".json"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                heights.push(h);
            }
        }
        heights.sort_unstable();
        Ok(heights)
    }

    /// Snapshot directories present on disk.
    pub fn snapshot_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join("snapshots"))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Block indices present on disk, ascending.
    pub fn block_indices(&self) -> Result<Vec<u64>, StorageError> {
        let mut indices = Vec::new();
        for entry in fs::read_dir(self.root.join("blocks"))? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(i) = name
                .strip_prefix("block_")
                .and_then(|s| s.strip_suffix(".json"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                indices.push(i);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }
}
