//! Local filesystem storage backend.
//!
//! The default backend: finalized objects live under
//! `<data_dir>/objects/<deviceId>/<measurementId>/<fileType>` and their
//! metadata records in the embedded RocksDB index. Uniqueness of the
//! `(device, measurement, file type)` slot is enforced by the index key.

use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncRead;
use tracing::info;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{object_key, FileType, StoredMeasurement};
use crate::services::database::MetadataIndex;
use crate::services::storage::temp::{AppendResult, TempStore};
use crate::services::storage::{
    MeasurementStorage, StatusKind, StoreStatus, UploadMetaData,
};
use async_trait::async_trait;

/// Filesystem-backed storage with an embedded metadata index
#[derive(Debug)]
pub struct LocalStorage {
    temp: TempStore,
    index: MetadataIndex,
    objects_dir: PathBuf,
}

impl LocalStorage {
    /// Create the backend, initializing its directories and index
    pub async fn new(config: &Config) -> Result<Self> {
        let temp = TempStore::new(config.upload.upload_folder.clone()).await?;
        let index = MetadataIndex::new(&config.storage.index_path())?;
        let objects_dir = config.storage.objects_path();

        if !objects_dir.exists() {
            fs::create_dir_all(&objects_dir).await?;
        }

        info!(
            objects = %objects_dir.display(),
            "Local storage backend initialized"
        );

        Ok(Self {
            temp,
            index,
            objects_dir,
        })
    }

    /// Direct access to the metadata index (used by tests and tooling)
    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    /// Destination path of a finalized object
    pub fn object_path(&self, device_id: &str, measurement_id: &str, file_type: FileType) -> PathBuf {
        self.objects_dir
            .join(device_id)
            .join(measurement_id)
            .join(file_type.as_str())
    }

    /// Move the assembled temp file into place and record its metadata.
    ///
    /// The index insert goes first so the unique slot check happens before
    /// any bytes move; a failed move rolls the record back.
    async fn finalize(&self, upload: &UploadMetaData, byte_size: u64) -> Result<()> {
        let meta = &upload.metadata;
        let dest = self.object_path(&meta.device_id, &meta.measurement_id, upload.file_type);

        let record = StoredMeasurement {
            device_id: meta.device_id.clone(),
            measurement_id: meta.measurement_id.clone(),
            file_type: upload.file_type,
            user_id: upload.principal.user_id.clone(),
            username: upload.principal.username.clone(),
            completed_at: Utc::now(),
            object_ref: dest.display().to_string(),
            byte_size,
            metadata: meta.clone(),
            attachment: upload.attachment,
        };

        self.index.insert_unique(&record)?;

        if let Err(e) = self.move_into_place(&upload.upload_identifier, &dest).await {
            self.index.remove(&record.key()).ok();
            return Err(e);
        }

        info!(
            device_id = %meta.device_id,
            measurement_id = %meta.measurement_id,
            file_type = %upload.file_type,
            byte_size = byte_size,
            "Stored measurement object"
        );

        Ok(())
    }

    async fn move_into_place(&self, upload_identifier: &str, dest: &PathBuf) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let src = self.temp.path_for(upload_identifier);

        match fs::rename(&src, dest).await {
            Ok(()) => Ok(()),
            // Upload folder and data dir may sit on different filesystems
            Err(_) => {
                fs::copy(&src, dest).await?;
                fs::remove_file(&src).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MeasurementStorage for LocalStorage {
    async fn store(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        upload: &UploadMetaData,
    ) -> Result<StoreStatus> {
        let id = &upload.upload_identifier;
        let lock = self.temp.lock_for(id);
        let _guard = lock.lock().await;

        match self.temp.append(id, source, &upload.content_range).await? {
            AppendResult::OutOfSync { bytes_stored }
            | AppendResult::Incomplete { bytes_stored } => Ok(StoreStatus {
                kind: StatusKind::Incomplete,
                upload_identifier: id.clone(),
                byte_size: bytes_stored,
            }),
            AppendResult::Complete { byte_size } => {
                match self.finalize(upload, byte_size).await {
                    Ok(()) => {
                        self.temp.remove(id).await?;
                        Ok(StoreStatus {
                            kind: StatusKind::Complete,
                            upload_identifier: id.clone(),
                            byte_size,
                        })
                    }
                    Err(e @ AppError::Conflict(_)) => {
                        // The slot is taken for good; the partial bytes are useless
                        self.temp.remove(id).await?;
                        Err(e)
                    }
                    // Keep the temp file so the client can retry the commit
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn bytes_uploaded(&self, upload_identifier: &str) -> Result<u64> {
        self.temp.bytes_stored(upload_identifier).await
    }

    async fn is_stored(
        &self,
        device_id: &str,
        measurement_id: &str,
        file_type: FileType,
    ) -> Result<bool> {
        self.index
            .contains(&object_key(device_id, measurement_id, file_type))
    }

    async fn clean(&self, upload_identifier: &str) -> Result<()> {
        self.temp.remove(upload_identifier).await
    }

    async fn sweep_expired(&self, max_age: Duration) -> Result<usize> {
        Ok(self.temp.sweep_expired(max_age).await?.len())
    }
}
