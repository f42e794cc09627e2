//! Attachment upload handlers.
//!
//! Attachments (logs, images, videos captured alongside a measurement) use
//! the same three-request protocol as measurements, scoped under the parent
//! measurement:
//!
//! - `POST /measurements/{deviceId}/{measurementId}/attachments` -
//!   pre-request; requires the parent measurement to be stored already.
//! - `PUT /measurements/{deviceId}/{measurementId}/attachments/{token}/` -
//!   status probe or chunk, exactly as for measurements.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{post, put},
    Extension, Router,
};
use tracing::info;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{AttachmentMetaData, FileType, Principal, UploadSession};
use crate::state::AppState;

use super::measurements::{dispatch_upload, lookup_session};

/// Create the attachment routes
pub fn routes(config: &Config) -> Router<AppState> {
    Router::new()
        .route(
            "/measurements/{device_id}/{measurement_id}/attachments",
            post(attachment_pre_request)
                .route_layer(DefaultBodyLimit::max(config.upload.pre_request_limit)),
        )
        .route(
            "/measurements/{device_id}/{measurement_id}/attachments/{token}/",
            put(attachment_upload),
        )
}

/// Accept an attachment pre-request
///
/// POST /measurements/{device_id}/{measurement_id}/attachments
async fn attachment_pre_request(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((device_id, measurement_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response> {
    let mut envelope: AttachmentMetaData =
        serde_json::from_slice(&body).map_err(|e| AppError::invalid_metadata(e.to_string()))?;
    envelope.validate()?;

    let canonical_id = envelope.measurement.parsed_measurement_id()?.to_string();
    envelope.measurement.measurement_id = canonical_id.clone();

    // The URL and the envelope must address the same measurement
    if device_id != envelope.measurement.device_id {
        return Err(AppError::invalid_metadata("deviceId"));
    }
    if parse_path_measurement_id(&measurement_id)? != canonical_id {
        return Err(AppError::invalid_metadata("measurementId"));
    }

    if !state
        .storage
        .is_stored(&device_id, &canonical_id, FileType::Measurement)
        .await?
    {
        return Err(AppError::MeasurementNotFound(format!(
            "measurement {} of device {}",
            canonical_id, device_id
        )));
    }

    if state
        .storage
        .is_stored(&device_id, &canonical_id, FileType::Attachment)
        .await?
    {
        return Err(AppError::conflict(format!(
            "attachments for measurement {} of device {} are already stored",
            canonical_id, device_id
        )));
    }

    let inventory = envelope.inventory();
    let session = UploadSession::new(
        envelope.measurement,
        Some(inventory),
        FileType::Attachment,
        principal,
    );
    let location =
        state.attachment_upload_url(&device_id, &canonical_id, &session.upload_identifier);

    info!(
        upload_identifier = %session.upload_identifier,
        device_id = %device_id,
        measurement_id = %canonical_id,
        files_size = inventory.files_size,
        "Accepted attachment pre-request"
    );

    state.sessions.insert(session);

    Ok((StatusCode::OK, [(header::LOCATION, location)]).into_response())
}

/// Receive a status probe or a chunk on the attachment upload URL
///
/// PUT /measurements/{device_id}/{measurement_id}/attachments/{token}/
async fn attachment_upload(
    State(state): State<AppState>,
    Path((device_id, measurement_id, token)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let session = lookup_session(&state, &token)?;

    // The URL must address the slot the session was opened for
    let canonical_id = measurement_id.parse::<u64>().ok().map(|id| id.to_string());
    if session.file_type != FileType::Attachment
        || session.metadata.device_id != device_id
        || canonical_id.as_deref() != Some(session.metadata.measurement_id.as_str())
    {
        return Err(AppError::session_not_found(token));
    }

    dispatch_upload(state, session, headers, body).await
}

/// A path measurement id is plain decimal, at most 19 digits
fn parse_path_measurement_id(segment: &str) -> Result<String> {
    if segment.is_empty() || segment.len() > 19 || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::invalid_metadata("measurementId"));
    }

    segment
        .parse::<u64>()
        .map(|id| id.to_string())
        .map_err(|_| AppError::invalid_metadata("measurementId"))
}
