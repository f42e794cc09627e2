//! Google Cloud Storage backend.
//!
//! Finalized uploads go through the storage JSON API's resumable upload:
//! a POST opens an upload session, then the assembled bytes are pushed in
//! fixed-size buffers with `Content-Range: bytes a-b/*` headers (the final
//! buffer carries the real total). The server acknowledges progress on 308
//! responses with a `Range` header; on a partial acknowledgement the source
//! is re-positioned and the unacknowledged tail is resent.
//!
//! Non-final buffers must be at least 256 KiB or the API rejects them,
//! which is why the configured buffer size has a floor.
//!
//! The metadata document lands in a MongoDB collection carrying the same
//! unique slot index as the GridFS backend.

use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::{Client, Collection};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

use crate::config::{Config, GoogleConfig};
use crate::error::{AppError, Result};
use crate::models::FileType;
use crate::services::storage::temp::{AppendResult, TempStore};
use crate::services::storage::{
    ensure_metadata_indexes, is_duplicate_key, metadata_document, metadata_filter,
    MeasurementStorage, StatusKind, StoreStatus, UploadMetaData,
};

/// Client for the storage API's resumable upload protocol
#[derive(Debug, Clone)]
pub struct ResumableClient {
    http: reqwest::Client,
    api_base_url: String,
    bucket: String,
    oauth_token: String,
    buffer_size: usize,
}

impl ResumableClient {
    /// Build a client from the google backend configuration
    pub fn new(google: &GoogleConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base_url: google.api_base_url.clone(),
            bucket: google.bucket.clone(),
            oauth_token: google.oauth_token.clone(),
            buffer_size: google.buffer_size,
        }
    }

    /// Open an upload session and return its session URI.
    ///
    /// The session URI authenticates all subsequent requests for this
    /// upload, so the bearer token is only needed here.
    async fn initiate(&self, object: &str) -> Result<String> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o/",
            self.api_base_url, self.bucket
        );

        let response = self
            .http
            .post(&url)
            .query(&[("uploadType", "resumable"), ("name", object)])
            .bearer_auth(&self.oauth_token)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::cloud_upload(format!(
                "initiating resumable upload for {} failed with status {}",
                object,
                response.status()
            )));
        }

        let session_uri = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                AppError::cloud_upload("no session URI in resumable upload response")
            })?;

        Ok(session_uri.to_string())
    }

    /// Upload a local file of known size as one object.
    pub async fn upload_file(&self, object: &str, path: &Path, total: u64) -> Result<()> {
        let session_uri = self.initiate(object).await?;
        let mut file = fs::File::open(path).await?;
        let mut position: u64 = 0;

        while position < total {
            let remaining = total - position;
            let want = remaining.min(self.buffer_size as u64) as usize;
            let mut buffer = vec![0u8; want];
            file.read_exact(&mut buffer).await?;

            let to = position + want as u64 - 1;
            let last = to + 1 == total;
            // Non-final buffers advertise an unknown total so the session
            // stays open when the server acknowledges only part of them.
            let range_total = if last {
                total.to_string()
            } else {
                "*".to_string()
            };
            let content_range = format!("bytes {}-{}/{}", position, to, range_total);

            debug!(object = %object, range = %content_range, "Uploading buffer");

            let response = self
                .http
                .put(&session_uri)
                .header(reqwest::header::CONTENT_RANGE, content_range)
                .body(buffer)
                .send()
                .await?;

            match response.status().as_u16() {
                200 | 201 if last => {
                    position = total;
                }
                308 => {
                    let next = acknowledged_end(response.headers())?
                        .map(|end| end + 1)
                        .unwrap_or(0);

                    if next < position || next > to + 1 {
                        return Err(AppError::cloud_upload(format!(
                            "implausible Range acknowledgement, upload at {} but server reports {}",
                            position, next
                        )));
                    }

                    if next != to + 1 {
                        file.seek(std::io::SeekFrom::Start(next)).await?;
                    }
                    position = next;
                }
                status => {
                    return Err(AppError::cloud_upload(format!(
                        "chunk upload for {} failed with status {}",
                        object, status
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Last stored byte index from a 308 `Range: bytes=0-<end>` header
fn acknowledged_end(headers: &reqwest::header::HeaderMap) -> Result<Option<u64>> {
    let Some(value) = headers.get(reqwest::header::RANGE) else {
        return Ok(None);
    };

    let value = value
        .to_str()
        .map_err(|_| AppError::cloud_upload("unreadable Range header"))?;

    let end = value
        .strip_prefix("bytes=0-")
        .and_then(|end| end.parse::<u64>().ok())
        .ok_or_else(|| {
            AppError::cloud_upload(format!("unparsable Range header: {}", value))
        })?;

    Ok(Some(end))
}

/// Cloud-blob-backed storage
pub struct GcsStorage {
    temp: TempStore,
    client: ResumableClient,
    metadata: Collection<Document>,
}

impl std::fmt::Debug for GcsStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsStorage").finish()
    }
}

impl GcsStorage {
    /// Connect to MongoDB, prepare the metadata collection and the client
    pub async fn connect(config: &Config) -> Result<Self> {
        let mongo = Client::with_uri_str(&config.mongodb.uri).await?;
        let db = mongo.database(&config.mongodb.database);

        let metadata = db.collection::<Document>(&config.mongodb.collection);
        ensure_metadata_indexes(&metadata).await?;

        let temp = TempStore::new(config.upload.upload_folder.clone()).await?;

        info!(
            bucket = %config.google.bucket,
            collection = %config.mongodb.collection,
            "Cloud storage backend initialized"
        );

        Ok(Self {
            temp,
            client: ResumableClient::new(&config.google),
            metadata,
        })
    }

    /// Object name of a slot inside the bucket
    fn object_name(upload: &UploadMetaData) -> String {
        format!(
            "{}/{}/{}",
            upload.metadata.device_id,
            upload.metadata.measurement_id,
            upload.file_type.as_str()
        )
    }

    async fn finalize(&self, upload: &UploadMetaData, byte_size: u64) -> Result<()> {
        let meta = &upload.metadata;

        if self
            .is_stored(&meta.device_id, &meta.measurement_id, upload.file_type)
            .await?
        {
            return Err(AppError::conflict(format!(
                "object already stored for {}",
                upload.object_key()
            )));
        }

        let object = Self::object_name(upload);
        let path = self.temp.path_for(&upload.upload_identifier);
        self.client.upload_file(&object, &path, byte_size).await?;

        let document = doc! {
            "filename": &object,
            "length": byte_size as i64,
            "metadata": metadata_document(upload),
        };

        self.metadata.insert_one(document).await.map_err(|e| {
            if is_duplicate_key(&e) {
                AppError::conflict(format!("object already stored for {}", upload.object_key()))
            } else {
                AppError::Mongo(e)
            }
        })?;

        info!(
            object = %object,
            byte_size = byte_size,
            "Stored measurement object in cloud bucket"
        );

        Ok(())
    }
}

#[async_trait]
impl MeasurementStorage for GcsStorage {
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
        let count = self.metadata.count_documents(filter).await?;

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
