//! Measurement metadata envelope and validation.
//!
//! Every upload starts with a JSON pre-request declaring the metadata of the
//! binary that will follow. The envelope is validated field by field before a
//! session is opened; the same data is persisted next to the finalized object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Version of the binary transfer format the server currently accepts.
pub const CURRENT_TRANSFER_FILE_FORMAT_VERSION: i32 = 3;

/// Kind of binary bound to a `(device, measurement)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// The sensor trace itself
    Measurement,
    /// Logs, images and videos captured alongside the trace
    Attachment,
}

impl FileType {
    /// Stable string form used in index keys and metadata documents
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Measurement => "measurement",
            Self::Attachment => "attachment",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single captured geo coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Latitude in decimal degrees
    pub lat: f64,
    /// Longitude in decimal degrees
    pub lon: f64,
}

impl GeoLocation {
    fn validate(&self, field: &str) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(AppError::invalid_metadata(format!("{}.lat", field)));
        }
        if !self.lon.is_finite() || !(-180.0..=180.0).contains(&self.lon) {
            return Err(AppError::invalid_metadata(format!("{}.lon", field)));
        }
        Ok(())
    }
}

/// Metadata envelope sent with a measurement pre-request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetaData {
    /// World-wide unique identifier of the uploading device (UUID string)
    pub device_id: String,

    /// Device-local measurement identifier (decimal, fits an unsigned 64 bit)
    pub measurement_id: String,

    /// Operating system version of the device
    pub os_version: String,

    /// Device model name
    pub device_type: String,

    /// Version of the uploading application
    pub application_version: String,

    /// Track length in meters
    pub length: f64,

    /// Number of captured geo locations
    pub location_count: u64,

    /// First captured location; present exactly when `location_count > 0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_location: Option<GeoLocation>,

    /// Last captured location; present exactly when `location_count > 0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_location: Option<GeoLocation>,

    /// Recording modality, e.g. BICYCLE or CAR
    pub modality: String,

    /// Binary layout version of the uploaded bytes
    pub format_version: i32,
}

impl RequestMetaData {
    /// Validate all envelope fields.
    ///
    /// Returns an `InvalidMetaData` error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.device_id.len() != 36 || Uuid::parse_str(&self.device_id).is_err() {
            return Err(AppError::invalid_metadata("deviceId"));
        }

        self.parsed_measurement_id()?;

        validate_label(&self.os_version, "osVersion")?;
        validate_label(&self.device_type, "deviceType")?;
        validate_label(&self.application_version, "applicationVersion")?;
        validate_label(&self.modality, "modality")?;

        if !self.length.is_finite() || self.length < 0.0 {
            return Err(AppError::invalid_metadata("length"));
        }

        // Locations travel as a pair or not at all, matching the count.
        match (self.location_count, &self.start_location, &self.end_location) {
            (0, None, None) => {}
            (n, Some(start), Some(end)) if n > 0 => {
                start.validate("startLocation")?;
                end.validate("endLocation")?;
            }
            _ => return Err(AppError::invalid_metadata("locationCount")),
        }

        if self.format_version != CURRENT_TRANSFER_FILE_FORMAT_VERSION {
            return Err(AppError::invalid_metadata("formatVersion"));
        }

        Ok(())
    }

    /// The measurement identifier as a number.
    ///
    /// Digits only, at most 20 characters. `"01"` and `"1"` address the same
    /// measurement, so keys are always built from this parsed value.
    pub fn parsed_measurement_id(&self) -> Result<u64> {
        let id = &self.measurement_id;
        if id.is_empty() || id.len() > 20 || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AppError::invalid_metadata("measurementId"));
        }
        id.parse::<u64>()
            .map_err(|_| AppError::invalid_metadata("measurementId"))
    }
}

fn validate_label(value: &str, field: &str) -> Result<()> {
    if value.is_empty() || value.len() > 30 {
        return Err(AppError::invalid_metadata(field));
    }
    Ok(())
}

/// Attachment inventory declared with an attachment pre-request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AttachmentInventory {
    pub log_count: u64,
    pub image_count: u64,
    pub video_count: u64,
    pub files_size: u64,
}

/// Metadata envelope sent with an attachment pre-request
///
/// Carries the full measurement envelope plus the attachment inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMetaData {
    #[serde(flatten)]
    pub measurement: RequestMetaData,

    /// Number of log files in the attachment bundle
    pub log_count: u64,

    /// Number of image files in the attachment bundle
    pub image_count: u64,

    /// Number of video files in the attachment bundle
    pub video_count: u64,

    /// Combined size of all bundled files in bytes
    pub files_size: u64,
}

impl AttachmentMetaData {
    /// Validate the envelope including the attachment inventory.
    pub fn validate(&self) -> Result<()> {
        self.measurement.validate()?;
        let file_count = self
            .log_count
            .saturating_add(self.image_count)
            .saturating_add(self.video_count);
        if file_count == 0 && self.files_size > 0 {
            return Err(AppError::invalid_metadata("filesSize"));
        }
        Ok(())
    }

    /// The attachment counts as persisted next to the stored object
    pub fn inventory(&self) -> AttachmentInventory {
        AttachmentInventory {
            log_count: self.log_count,
            image_count: self.image_count,
            video_count: self.video_count,
            files_size: self.files_size,
        }
    }
}

/// Metadata record persisted next to a finalized object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMeasurement {
    /// Device identifier (UUID string)
    pub device_id: String,

    /// Canonical decimal measurement identifier
    pub measurement_id: String,

    /// Kind of stored binary
    pub file_type: FileType,

    /// Identifier of the uploading user
    pub user_id: String,

    /// Name of the uploading user
    pub username: String,

    /// When the final chunk was committed
    pub completed_at: DateTime<Utc>,

    /// Backend-specific handle of the stored bytes (path, files id, object name)
    pub object_ref: String,

    /// Total size of the stored bytes
    pub byte_size: u64,

    /// Full envelope as declared by the client
    pub metadata: RequestMetaData,

    /// Attachment inventory; `None` for measurement objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentInventory>,
}

impl StoredMeasurement {
    /// Index key addressing the unique `(device, measurement, file type)` slot
    pub fn key(&self) -> String {
        object_key(&self.device_id, &self.measurement_id, self.file_type)
    }
}

/// Build the index key for a `(device, measurement, file type)` tuple
pub fn object_key(device_id: &str, measurement_id: &str, file_type: FileType) -> String {
    format!("{}:{}:{}", device_id, measurement_id, file_type.as_str())
}
