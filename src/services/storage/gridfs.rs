//! MongoDB GridFS storage backend.
//!
//! Finalized uploads are streamed into a GridFS bucket; the declared
//! envelope travels as the files-document metadata. The unique compound
//! index on `(metadata.deviceId, metadata.measurementId, metadata.fileType)`
//! is created idempotently at startup and is the durable guarantee that a
//! slot is stored at most once, with an explicit lookup before the write to
//! keep the common duplicate answer cheap.

use async_trait::async_trait;
use futures::io::AsyncWriteExt;
use mongodb::bson::Document;
use mongodb::gridfs::GridFsBucket;
use mongodb::options::GridFsBucketOptions;
use mongodb::{Client, Collection};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::info;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::FileType;
use crate::services::storage::temp::{AppendResult, TempStore};
use crate::services::storage::{
    ensure_metadata_indexes, is_duplicate_key, metadata_document, metadata_filter,
    MeasurementStorage, StatusKind, StoreStatus, UploadMetaData,
};

/// Buffer size for streaming the assembled temp file into the bucket
const BUCKET_WRITE_BUFFER: usize = 64 * 1024;

/// GridFS-backed storage
pub struct GridFsStorage {
    temp: TempStore,
    bucket: GridFsBucket,
    files: Collection<Document>,
}

impl std::fmt::Debug for GridFsStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridFsStorage").finish()
    }
}

impl GridFsStorage {
    /// Connect to MongoDB and prepare the bucket and its indexes
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = Client::with_uri_str(&config.mongodb.uri).await?;
        let db = client.database(&config.mongodb.database);

        let options = GridFsBucketOptions::builder()
            .bucket_name(config.mongodb.bucket.clone())
            .build();
        let bucket = db.gridfs_bucket(options);

        let files = db.collection::<Document>(&format!("{}.files", config.mongodb.bucket));
        ensure_metadata_indexes(&files).await?;

        let temp = TempStore::new(config.upload.upload_folder.clone()).await?;

        info!(
            database = %config.mongodb.database,
            bucket = %config.mongodb.bucket,
            "GridFS storage backend initialized"
        );

        Ok(Self {
            temp,
            bucket,
            files,
        })
    }

    /// Stream the assembled temp file into the bucket with its metadata
    async fn finalize(&self, upload: &UploadMetaData, byte_size: u64) -> Result<()> {
        let meta = &upload.metadata;

        // Cheap early answer; the unique index below stays the backstop
        if self
            .is_stored(&meta.device_id, &meta.measurement_id, upload.file_type)
            .await?
        {
            return Err(AppError::conflict(format!(
                "object already stored for {}",
                upload.object_key()
            )));
        }

        let filename = format!("{}_{}", meta.device_id, meta.measurement_id);
        let mut upload_stream = self
            .bucket
            .open_upload_stream(&filename)
            .metadata(metadata_document(upload))
            .await?;

        let mut file = fs::File::open(self.temp.path_for(&upload.upload_identifier)).await?;
        let mut buffer = vec![0u8; BUCKET_WRITE_BUFFER];

        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            if let Err(e) = upload_stream.write_all(&buffer[..n]).await {
                upload_stream.abort().await.ok();
                return Err(bucket_write_error(e, &upload.object_key()));
            }
        }

        if let Err(e) = upload_stream.close().await {
            return Err(bucket_write_error(e, &upload.object_key()));
        }

        info!(
            device_id = %meta.device_id,
            measurement_id = %meta.measurement_id,
            file_type = %upload.file_type,
            byte_size = byte_size,
            "Stored measurement object in GridFS"
        );

        Ok(())
    }
}

/// Map a bucket stream error, surfacing unique-key violations as conflicts
fn bucket_write_error(e: std::io::Error, key: &str) -> AppError {
    let duplicate = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<mongodb::error::Error>())
        .map(is_duplicate_key)
        .unwrap_or(false);

    if duplicate {
        AppError::conflict(format!("object already stored for {}", key))
    } else {
        AppError::Io(e)
    }
}

#[async_trait]
impl MeasurementStorage for GridFsStorage {
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
        let filter = metadata_filter(device_id, measurement_id, file_type);
        let count = self.files.count_documents(filter).await?;

        match count {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(AppError::DuplicatesInDatabase(format!(
                "{} stored objects for device {} measurement {} ({})",
                n, device_id, measurement_id, file_type
            ))),
        }
    }

    async fn clean(&self, upload_identifier: &str) -> Result<()> {
        self.temp.remove(upload_identifier).await
    }

    async fn sweep_expired(&self, max_age: Duration) -> Result<usize> {
        Ok(self.temp.sweep_expired(max_age).await?.len())
    }
}
