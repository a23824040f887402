//! Append-only log of inverse operations.
//!
//! Every op applied by a [`BoundTransformation`](crate::transform::BoundTransformation)
//! that can be undone pushes its inverse here. Replaying the log backwards by hand
//! (or with a tool reading [`FileRollbackLog::read_all`]) restores the topology
//! after a failed run.
//!
//! # Storage Format
//!
//! ```text
//! ┌──────────────┬─────────────────────────┬──────────────┬─────
//! │ len: u32 LE  │ bincode(RollbackEntry)  │ len: u32 LE  │ ...
//! └──────────────┴─────────────────────────┴──────────────┴─────
//! ```

use crate::error::{Error, Result};
use crate::transform::{Phase, ResolvedOp};
use crate::types::Forwarding;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// One recorded inverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEntry {
    /// Forwarding the original op belonged to.
    pub forwarding: Forwarding,
    /// Phase the original op ran in.
    pub phase: Phase,
    /// Op that undoes the original.
    pub inverse: ResolvedOp,
}

/// Sink for rollback entries.
#[async_trait::async_trait]
pub trait RollbackLog: Send + Sync + std::fmt::Debug {
    /// Append an entry. Returns once the entry is durable.
    async fn push(&self, entry: &RollbackEntry) -> Result<()>;
}

/// In-memory implementation for testing.
#[derive(Debug, Default)]
pub struct MemoryRollbackLog {
    entries: Mutex<Vec<RollbackEntry>>,
}

impl MemoryRollbackLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries pushed so far.
    pub fn entries(&self) -> Vec<RollbackEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait::async_trait]
impl RollbackLog for MemoryRollbackLog {
    async fn push(&self, entry: &RollbackEntry) -> Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// File-backed log of length-prefixed bincode records.
#[derive(Debug)]
pub struct FileRollbackLog {
    path: PathBuf,
    file: tokio::sync::Mutex<fs::File>,
}

impl FileRollbackLog {
    /// Open (or create) a log file for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::RollbackLog(format!("Failed to open {}: {}", path.display(), e)))?;

        tracing::info!(path = ?path, "Opened rollback log");

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry from a log file.
    pub async fn read_all(path: impl AsRef<Path>) -> Result<Vec<RollbackEntry>> {
        let content = fs::read(path.as_ref()).await?;
        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < content.len() {
            let header = content
                .get(offset..offset + 4)
                .ok_or_else(|| Error::RollbackLog(format!("Truncated header at {}", offset)))?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            offset += 4;

            let body = content
                .get(offset..offset + len)
                .ok_or_else(|| Error::RollbackLog(format!("Truncated record at {}", offset)))?;
            entries.push(bincode::deserialize(body)?);
            offset += len;
        }

        Ok(entries)
    }
}

#[async_trait::async_trait]
impl RollbackLog for FileRollbackLog {
    async fn push(&self, entry: &RollbackEntry) -> Result<()> {
        let body = bincode::serialize(entry)?;
        let len = u32::try_from(body.len())
            .map_err(|_| Error::RollbackLog("Entry too large".to_string()))?;

        let mut record = Vec::with_capacity(body.len() + 4);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&body);

        let mut file = self.file.lock().await;
        file.write_all(&record).await?;
        file.sync_data().await?;

        tracing::trace!(
            forwarding = %entry.forwarding,
            phase = %entry.phase,
            inverse = %entry.inverse,
            "Recorded rollback entry"
        );
        Ok(())
    }
}
