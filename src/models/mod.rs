//! Data models for the measurement upload server.
//!
//! This module contains the metadata envelope, the upload session state
//! machine and the wire-level Content-Range parsing.

pub mod content_range;
pub mod metadata;
pub mod upload_session;

pub use content_range::{ChunkRange, ContentRange};
pub use metadata::{
    object_key, AttachmentInventory, AttachmentMetaData, FileType, GeoLocation, RequestMetaData,
    StoredMeasurement, CURRENT_TRANSFER_FILE_FORMAT_VERSION,
};
pub use upload_session::{Principal, SessionState, UploadSession};
