//! Business logic services for the measurement upload server.

pub mod database;
pub mod sessions;
pub mod storage;

pub use database::MetadataIndex;
pub use sessions::SessionRegistry;
pub use storage::{MeasurementStorage, StatusKind, StoreStatus, UploadMetaData};
