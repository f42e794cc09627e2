//! Temp-file engine shared by all storage backends.
//!
//! Every upload in flight owns exactly one append-only file named by its
//! upload identifier, living flat in the upload folder. The file length is
//! the single source of truth for how many contiguous bytes have been
//! acknowledged: a chunk is only written when it starts precisely at the
//! current end of the file.
//!
//! Appends stream directly from the request body to disk, so a chunk never
//! has to fit in memory and network back-pressure follows disk speed.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::ChunkRange;

/// Outcome of a single chunk append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// The chunk did not start at the current end of the file; nothing was
    /// written. Carries the number of bytes actually stored so the caller
    /// can hand the client its canonical resume position.
    OutOfSync { bytes_stored: u64 },
    /// Chunk accepted, more bytes outstanding
    Incomplete { bytes_stored: u64 },
    /// Chunk accepted and the declared total is reached
    Complete { byte_size: u64 },
}

/// Append-only temp storage for partial uploads
#[derive(Debug)]
pub struct TempStore {
    upload_folder: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TempStore {
    /// Create the store, ensuring the upload folder exists
    pub async fn new(upload_folder: PathBuf) -> Result<Self> {
        if !upload_folder.exists() {
            fs::create_dir_all(&upload_folder).await?;
        }

        info!(path = %upload_folder.display(), "Temp store initialized");

        Ok(Self {
            upload_folder,
            locks: DashMap::new(),
        })
    }

    /// Path of the partial file for an upload identifier
    pub fn path_for(&self, upload_identifier: &str) -> PathBuf {
        self.upload_folder.join(upload_identifier)
    }

    /// The per-upload append lock.
    ///
    /// Exactly one chunk per identifier may be appended or finalized at a
    /// time; concurrent requests for the same identifier queue here.
    pub fn lock_for(&self, upload_identifier: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(upload_identifier.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of contiguous bytes stored for an upload (0 when no file exists)
    pub async fn bytes_stored(&self, upload_identifier: &str) -> Result<u64> {
        match fs::metadata(self.path_for(upload_identifier)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Append one chunk from `source` to the upload's partial file.
    ///
    /// The caller must hold the lock from [`lock_for`](Self::lock_for).
    /// When the chunk does not start at the current file end the body is
    /// left unread and the file untouched. A body whose actual length
    /// disagrees with the declared range leaves the inconsistency to the
    /// caller as `ContentRangeNotMatchingFileSize`.
    pub async fn append(
        &self,
        upload_identifier: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        chunk: &ChunkRange,
    ) -> Result<AppendResult> {
        let path = self.path_for(upload_identifier);
        let current = self.bytes_stored(upload_identifier).await?;

        if chunk.from != current {
            warn!(
                upload_identifier = %upload_identifier,
                expected = current,
                got = chunk.from,
                "Chunk offset mismatch"
            );
            return Ok(AppendResult::OutOfSync {
                bytes_stored: current,
            });
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        // Read one byte past the declared length so an over-long body is
        // caught by the length check below instead of growing the file.
        let declared = chunk.len();
        let mut limited = (&mut *source).take(declared + 1);
        let written = tokio::io::copy(&mut limited, &mut file).await?;
        file.flush().await?;
        drop(file);

        let new_len = fs::metadata(&path).await?.len();

        if written != declared || new_len != chunk.to + 1 {
            return Err(AppError::ContentRangeNotMatchingFileSize(format!(
                "expected {} bytes after chunk {}-{}, file has {}",
                chunk.to + 1,
                chunk.from,
                chunk.to,
                new_len
            )));
        }

        debug!(
            upload_identifier = %upload_identifier,
            received = new_len,
            total = chunk.total,
            "Chunk appended"
        );

        if new_len == chunk.total {
            Ok(AppendResult::Complete { byte_size: new_len })
        } else {
            Ok(AppendResult::Incomplete {
                bytes_stored: new_len,
            })
        }
    }

    /// Delete the partial file and release the append lock
    pub async fn remove(&self, upload_identifier: &str) -> Result<()> {
        let path = self.path_for(upload_identifier);

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(upload_identifier = %upload_identifier, "Deleted partial upload file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.locks.remove(upload_identifier);
        Ok(())
    }

    /// Delete all partial files whose last modification is older than
    /// `max_age`, returning the swept upload identifiers.
    pub async fn sweep_expired(&self, max_age: Duration) -> Result<Vec<String>> {
        let now = SystemTime::now();
        let mut swept = Vec::new();

        let mut entries = fs::read_dir(&self.upload_folder).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            if !path.is_file() {
                continue;
            }

            let expired = fs::metadata(&path)
                .await
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .map(|age| age > max_age)
                .unwrap_or(false);

            if !expired {
                continue;
            }

            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to sweep partial upload");
                continue;
            }

            info!(path = %path.display(), "Swept abandoned partial upload");

            if let Some(name) = file_name(&path) {
                self.locks.remove(&name);
                swept.push(name);
            }
        }

        Ok(swept)
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}
