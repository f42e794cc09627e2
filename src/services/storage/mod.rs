//! Storage backends for finalized measurement uploads.
//!
//! All backends share the same contract: chunks are accumulated through the
//! temp-file engine, and once the declared total is reached the bytes are
//! finalized into the backend's durable form together with a metadata
//! record. The `(device, measurement, file type)` tuple is unique across
//! every backend.
//!
//! Available backends:
//! - [`LocalStorage`] - filesystem objects plus an embedded RocksDB index
//! - [`GridFsStorage`] - MongoDB GridFS bucket
//! - [`GcsStorage`] - Google Cloud Storage blob plus a MongoDB metadata
//!   collection

pub mod gcs;
pub mod gridfs;
pub mod local;
pub mod temp;

pub use gcs::GcsStorage;
pub use gridfs::GridFsStorage;
pub use local::LocalStorage;
pub use temp::{AppendResult, TempStore};

use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::options::IndexOptions;
use mongodb::{Collection, IndexModel};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

use crate::config::{Config, StorageType};
use crate::error::Result;
use crate::models::{
    object_key, AttachmentInventory, ChunkRange, FileType, GeoLocation, Principal,
    RequestMetaData, UploadSession,
};

/// Whether a `store` call finished the upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// All declared bytes are persisted and finalized
    Complete,
    /// More chunks are outstanding (or the chunk was out of sync)
    Incomplete,
}

/// Result of a `store` call
#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub kind: StatusKind,
    pub upload_identifier: String,
    /// Bytes currently stored; equals the declared total when complete
    pub byte_size: u64,
}

/// Everything a backend needs to know about the upload a chunk belongs to
#[derive(Debug, Clone)]
pub struct UploadMetaData {
    pub upload_identifier: String,
    pub metadata: RequestMetaData,
    pub attachment: Option<AttachmentInventory>,
    pub file_type: FileType,
    pub principal: Principal,
    pub content_range: ChunkRange,
}

impl UploadMetaData {
    /// Snapshot the session state relevant to storing one chunk
    pub fn from_session(session: &UploadSession, content_range: ChunkRange) -> Self {
        Self {
            upload_identifier: session.upload_identifier.clone(),
            metadata: session.metadata.clone(),
            attachment: session.attachment,
            file_type: session.file_type,
            principal: session.principal.clone(),
            content_range,
        }
    }

    /// Index key of the `(device, measurement, file type)` slot
    pub fn object_key(&self) -> String {
        object_key(
            &self.metadata.device_id,
            &self.metadata.measurement_id,
            self.file_type,
        )
    }
}

/// Backend interface for resumable measurement uploads.
///
/// Implementations may be called concurrently; chunk ordering per upload
/// identifier is the caller's concern, backed by the temp engine's
/// per-identifier lock.
#[async_trait]
pub trait MeasurementStorage: Send + Sync {
    /// Append one chunk; finalize the upload when the declared total is
    /// reached. An out-of-sync chunk is reported as `Incomplete` with the
    /// current byte count and leaves the stored bytes untouched.
    async fn store(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        upload: &UploadMetaData,
    ) -> Result<StoreStatus>;

    /// Contiguous bytes acknowledged so far for an upload identifier
    async fn bytes_uploaded(&self, upload_identifier: &str) -> Result<u64>;

    /// Whether a finalized object occupies the given slot.
    ///
    /// Fails with `DuplicatesInDatabase` when more than one record matches.
    async fn is_stored(
        &self,
        device_id: &str,
        measurement_id: &str,
        file_type: FileType,
    ) -> Result<bool>;

    /// Drop the partial bytes of an upload
    async fn clean(&self, upload_identifier: &str) -> Result<()>;

    /// Delete partial uploads idle longer than `max_age`; returns how many
    async fn sweep_expired(&self, max_age: Duration) -> Result<usize>;
}

/// Construct the backend selected by the configuration
pub async fn build_storage(config: &Config) -> Result<Arc<dyn MeasurementStorage>> {
    match config.storage.storage_type {
        StorageType::Local => Ok(Arc::new(LocalStorage::new(config).await?)),
        StorageType::Gridfs => Ok(Arc::new(GridFsStorage::connect(config).await?)),
        StorageType::Google => Ok(Arc::new(GcsStorage::connect(config).await?)),
    }
}

/// Build the metadata document persisted next to the stored bytes.
///
/// The document shape matches the compound index in
/// [`ensure_metadata_indexes`]; both Mongo-backed backends use it verbatim.
pub(crate) fn metadata_document(upload: &UploadMetaData) -> Document {
    let meta = &upload.metadata;

    let mut document = doc! {
        "deviceId": &meta.device_id,
        "measurementId": &meta.measurement_id,
        "fileType": upload.file_type.as_str(),
        "userId": &upload.principal.user_id,
        "username": &upload.principal.username,
        "osVersion": &meta.os_version,
        "deviceType": &meta.device_type,
        "applicationVersion": &meta.application_version,
        "length": meta.length,
        "locationCount": meta.location_count as i64,
        "modality": &meta.modality,
        "formatVersion": meta.format_version,
        "completedAt": mongodb::bson::DateTime::now(),
    };

    if let Some(start) = &meta.start_location {
        document.insert("startLocation", location_document(start));
    }
    if let Some(end) = &meta.end_location {
        document.insert("endLocation", location_document(end));
    }

    if let Some(attachment) = &upload.attachment {
        document.insert("logCount", attachment.log_count as i64);
        document.insert("imageCount", attachment.image_count as i64);
        document.insert("videoCount", attachment.video_count as i64);
        document.insert("filesSize", attachment.files_size as i64);
    }

    document
}

fn location_document(location: &GeoLocation) -> Document {
    doc! {
        "timestamp": location.timestamp,
        "lat": location.lat,
        "lon": location.lon,
    }
}

/// Filter addressing one `(device, measurement, file type)` slot
pub(crate) fn metadata_filter(
    device_id: &str,
    measurement_id: &str,
    file_type: FileType,
) -> Document {
    doc! {
        "metadata.deviceId": device_id,
        "metadata.measurementId": measurement_id,
        "metadata.fileType": file_type.as_str(),
    }
}

/// Idempotently create the indexes every Mongo-backed metadata store needs:
/// the unique compound slot index and the secondary per-user index.
pub(crate) async fn ensure_metadata_indexes(collection: &Collection<Document>) -> Result<()> {
    let unique_slot = IndexModel::builder()
        .keys(doc! {
            "metadata.deviceId": 1,
            "metadata.measurementId": 1,
            "metadata.fileType": 1,
        })
        .options(IndexOptions::builder().unique(true).build())
        .build();
    collection.create_index(unique_slot).await?;

    let by_user = IndexModel::builder()
        .keys(doc! { "metadata.userId": 1 })
        .build();
    collection.create_index(by_user).await?;

    Ok(())
}

/// Whether a MongoDB error is a unique-key violation (code 11000)
pub(crate) fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};

    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        ErrorKind::Command(command_error) => command_error.code == 11000,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::tests::valid_metadata;

    fn upload_meta() -> UploadMetaData {
        UploadMetaData {
            upload_identifier: "abcdef0123456789abcdef0123456789".to_string(),
            metadata: valid_metadata(),
            attachment: None,
            file_type: FileType::Measurement,
            principal: Principal::anonymous(),
            content_range: ChunkRange {
                from: 0,
                to: 14,
                total: 15,
            },
        }
    }

    #[test]
    fn test_metadata_document_shape() {
        let document = metadata_document(&upload_meta());

        assert_eq!(
            document.get_str("deviceId").unwrap(),
            "78370516-4f7e-11ed-bdc3-0242ac120002"
        );
        assert_eq!(document.get_str("fileType").unwrap(), "measurement");
        assert_eq!(document.get_i64("locationCount").unwrap(), 0);
        assert!(!document.contains_key("startLocation"));
        assert!(!document.contains_key("logCount"));
    }

    #[test]
    fn test_metadata_document_with_attachment_inventory() {
        let mut upload = upload_meta();
        upload.file_type = FileType::Attachment;
        upload.attachment = Some(AttachmentInventory {
            log_count: 1,
            image_count: 2,
            video_count: 0,
            files_size: 4096,
        });

        let document = metadata_document(&upload);
        assert_eq!(document.get_str("fileType").unwrap(), "attachment");
        assert_eq!(document.get_i64("imageCount").unwrap(), 2);
        assert_eq!(document.get_i64("filesSize").unwrap(), 4096);
    }

    #[test]
    fn test_metadata_filter_matches_index_keys() {
        let filter = metadata_filter("device", "1", FileType::Measurement);
        assert_eq!(filter.get_str("metadata.deviceId").unwrap(), "device");
        assert_eq!(filter.get_str("metadata.measurementId").unwrap(), "1");
        assert_eq!(filter.get_str("metadata.fileType").unwrap(), "measurement");
    }
}
