//! Append-only GPU sample log.
//!
//! Keys are `gpu:<timestamp>:<sequence>` with both numbers zero-padded to 20
//! digits, so sled's byte order is capture-time order. The sequence comes from
//! `Db::generate_id`, which is monotonic across restarts, and separates
//! samples taken within the same second.

use crate::state::GpuSnapshot;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const GPU_KEY_PREFIX: &str = "gpu:";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open history store at {path}: {source}")]
    Open { path: String, source: sled::Error },
    #[error("history store I/O failed: {0}")]
    Io(#[from] sled::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("corrupt history record {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct HistoryStore {
    db: sled::Db,
    path: PathBuf,
}

impl HistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let db = sled::Config::default()
            .path(&path)
            .open()
            .map_err(|source| StorageError::Open {
                path: path.display().to_string(),
                source,
            })?;
        info!(path = %path.display(), records = db.len(), "history store opened");
        Ok(Self { db, path })
    }

    pub fn append(&self, snapshot: &GpuSnapshot) -> Result<(), StorageError> {
        let sequence = self.db.generate_id()?;
        let key = record_key(snapshot.timestamp, sequence);
        let value = serde_json::to_vec(snapshot).map_err(StorageError::Encode)?;
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Snapshots with `start <= timestamp <= end`, oldest first.
    pub fn query_range(&self, start: i64, end: i64) -> Result<Vec<GpuSnapshot>, StorageError> {
        if start > end {
            return Ok(Vec::new());
        }
        let lower = time_prefix(start);
        let upper = time_prefix(end.saturating_add(1));

        let mut out = Vec::new();
        for item in self.db.range(lower.as_bytes()..upper.as_bytes()) {
            let (key, value) = item?;
            let snapshot =
                serde_json::from_slice(&value).map_err(|source| StorageError::Decode {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    source,
                })?;
            out.push(snapshot);
        }
        debug!(start, end, records = out.len(), "history range scanned");
        Ok(out)
    }

    /// The last `range_secs` seconds up to and including `now`.
    pub fn query_recent(&self, range_secs: u64, now: i64) -> Result<Vec<GpuSnapshot>, StorageError> {
        let range = i64::try_from(range_secs).unwrap_or(i64::MAX);
        self.query_range(now.saturating_sub(range), now)
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    /// Flushes pending writes and releases the database. Consumes the store,
    /// so it can only happen once.
    pub fn close(self) -> Result<(), StorageError> {
        let bytes = self.db.flush()?;
        info!(path = %self.path.display(), flushed_bytes = bytes, "history store closed");
        Ok(())
    }
}

fn time_prefix(timestamp: i64) -> String {
    format!("{GPU_KEY_PREFIX}{:020}", timestamp.max(0))
}

fn record_key(timestamp: i64, sequence: u64) -> String {
    format!("{}:{:020}", time_prefix(timestamp), sequence)
}
