//! Measurement upload handlers.
//!
//! The upload protocol consists of three request kinds over one endpoint
//! group:
//!
//! ## Pre-request
//! - `POST /measurements` - declare the metadata of an upcoming upload.
//!   Answers `200` with a `Location` header naming the upload URL, `409`
//!   when the measurement is already stored, `422` on an invalid envelope.
//!
//! ## Status (resume query)
//! - `PUT <upload-url>` with `Content-Range: bytes */<total>` and an empty
//!   body. Answers `200` when the object already exists, otherwise `308`
//!   with `Range: bytes=0-<last>` (no `Range` header while no bytes are
//!   stored).
//!
//! ## Chunk
//! - `PUT <upload-url>` with `Content-Range: bytes <from>-<to>/<total>` and
//!   an `application/octet-stream` body. `<from>` must equal the number of
//!   bytes stored so far; a chunk anywhere else gets `308` with the
//!   canonical `Range` so the client can resynchronize. The final chunk
//!   commits the upload and answers `201`.
//!
//! # Example
//!
//! ```bash
//! # 1. Pre-request
//! curl -X POST http://localhost:8080/api/v1/measurements \
//!   -H "Content-Type: application/json; charset=UTF-8" \
//!   -d @metadata.json -i
//!
//! # 2. Upload chunks against the returned Location
//! curl -X PUT "http://localhost:8080/api/v1/measurements/(<token>)/" \
//!   -H "Content-Range: bytes 0-5242879/10485760" \
//!   --data-binary @chunk1
//! ```

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{post, put},
    Extension, Router,
};
use futures::TryStreamExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{
    ChunkRange, ContentRange, FileType, Principal, RequestMetaData, SessionState, UploadSession,
};
use crate::services::storage::{StatusKind, UploadMetaData};
use crate::state::AppState;

/// Create the measurement routes
///
/// The router allows only one parameter name per path position, so the
/// session-token segment shares the `{device_id}` name with the attachment
/// routes; extraction is positional.
pub fn routes(config: &Config) -> Router<AppState> {
    Router::new()
        .route(
            "/measurements",
            post(measurement_pre_request)
                .route_layer(DefaultBodyLimit::max(config.upload.pre_request_limit)),
        )
        .route("/measurements/{device_id}/", put(measurement_upload))
}

/// Accept a measurement pre-request
///
/// POST /measurements
async fn measurement_pre_request(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Response> {
    let mut metadata: RequestMetaData =
        serde_json::from_slice(&body).map_err(|e| AppError::invalid_metadata(e.to_string()))?;
    metadata.validate()?;
    metadata.measurement_id = metadata.parsed_measurement_id()?.to_string();

    if state
        .storage
        .is_stored(
            &metadata.device_id,
            &metadata.measurement_id,
            FileType::Measurement,
        )
        .await?
    {
        return Err(AppError::conflict(format!(
            "measurement {} of device {} is already stored",
            metadata.measurement_id, metadata.device_id
        )));
    }

    let session = UploadSession::new(metadata, None, FileType::Measurement, principal);
    let location = state.measurement_upload_url(&session.upload_identifier);

    info!(
        upload_identifier = %session.upload_identifier,
        device_id = %session.metadata.device_id,
        measurement_id = %session.metadata.measurement_id,
        "Accepted measurement pre-request"
    );

    state.sessions.insert(session);

    Ok((StatusCode::OK, [(header::LOCATION, location)]).into_response())
}

/// Receive a status probe or a chunk on the upload URL
///
/// PUT /measurements/{token}/
async fn measurement_upload(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let session = lookup_session(&state, &token)?;

    if session.file_type != FileType::Measurement {
        return Err(AppError::session_not_found(token));
    }

    dispatch_upload(state, session, headers, body).await
}

/// Resolve the parenthesized URL token to its open session
pub(super) fn lookup_session(state: &AppState, segment: &str) -> Result<UploadSession> {
    let token = UploadSession::parse_token(segment)
        .ok_or_else(|| AppError::session_not_found(segment.to_string()))?;

    state
        .sessions
        .get(token)
        .ok_or_else(|| AppError::session_not_found(token.to_string()))
}

/// Route a PUT on an upload URL to the status or chunk path
pub(super) async fn dispatch_upload(
    state: AppState,
    session: UploadSession,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let header_value = headers
        .get(header::CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::invalid_content_range("missing Content-Range header"))?;

    let range = ContentRange::parse(header_value)
        .ok_or_else(|| AppError::invalid_content_range(header_value.to_string()))?;

    match range {
        ContentRange::Status { .. } => handle_status(state, session).await,
        ContentRange::Chunk(chunk) => handle_chunk(state, session, chunk, body).await,
    }
}

/// Answer a resume query
async fn handle_status(state: AppState, mut session: UploadSession) -> Result<Response> {
    if state
        .storage
        .is_stored(
            &session.metadata.device_id,
            &session.metadata.measurement_id,
            session.file_type,
        )
        .await?
    {
        return Ok(StatusCode::OK.into_response());
    }

    let bytes_stored = state
        .storage
        .bytes_uploaded(&session.upload_identifier)
        .await?;

    // The janitor may have removed the partial file underneath the session
    if bytes_stored == 0 && session.upload_path.is_some() {
        session.reset_upload_path();
        state.sessions.update(&session);
    }

    debug!(
        upload_identifier = %session.upload_identifier,
        bytes_stored = bytes_stored,
        "Upload status probe"
    );

    Ok(resume_incomplete(bytes_stored))
}

/// Stream one chunk into storage
async fn handle_chunk(
    state: AppState,
    mut session: UploadSession,
    chunk: ChunkRange,
    body: Body,
) -> Result<Response> {
    if !session.state.can_accept_chunks() {
        return Err(AppError::conflict(format!(
            "upload {} is finalizing",
            session.upload_identifier
        )));
    }

    if chunk.len() > state.payload_limit() {
        // A chunk this size can never be accepted, so the upload is a loss
        abandon_session(&state, &mut session).await;
        return Err(AppError::payload_too_large(format!(
            "chunk of {} bytes exceeds the limit of {} bytes",
            chunk.len(),
            state.payload_limit()
        )));
    }

    let current = state
        .storage
        .bytes_uploaded(&session.upload_identifier)
        .await?;

    if current == 0 && session.upload_path.is_some() {
        session.reset_upload_path();
        state.sessions.update(&session);
    }

    if chunk.from != current {
        warn!(
            upload_identifier = %session.upload_identifier,
            expected = current,
            got = chunk.from,
            "Rejecting out-of-order chunk"
        );
        return Ok(resume_incomplete(current));
    }

    if chunk.is_final() {
        session.mark_committing();
        state.sessions.update(&session);
    }

    let upload = UploadMetaData::from_session(&session, chunk);
    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let mut reader = StreamReader::new(stream);

    let status = match state.storage.store(&mut reader, &upload).await {
        Ok(status) => status,
        Err(e @ AppError::ContentRangeNotMatchingFileSize(_)) => {
            // The stored bytes no longer line up with anything the client
            // could resume from
            abandon_session(&state, &mut session).await;
            return Err(e);
        }
        Err(e @ AppError::Conflict(_)) => {
            session.mark_abandoned();
            state.sessions.remove(&session.upload_identifier);
            return Err(e);
        }
        Err(e) => {
            // Transient failure: keep the session and bytes for a retry
            if session.state == SessionState::Committing {
                let path = state.temp_path(&session.upload_identifier);
                session.mark_partial(path);
                state.sessions.update(&session);
            }
            return Err(e);
        }
    };

    match status.kind {
        StatusKind::Complete => {
            session.mark_committed();
            state.sessions.remove(&session.upload_identifier);

            info!(
                upload_identifier = %session.upload_identifier,
                device_id = %session.metadata.device_id,
                measurement_id = %session.metadata.measurement_id,
                byte_size = status.byte_size,
                "Upload committed"
            );

            Ok(StatusCode::CREATED.into_response())
        }
        StatusKind::Incomplete => {
            // The append only counts when the file ends exactly where this
            // chunk said it would; otherwise a concurrent chunk won the race
            if status.byte_size == chunk.to + 1 {
                let path = state.temp_path(&session.upload_identifier);
                session.mark_partial(path);
                state.sessions.update(&session);
            }
            Ok(resume_incomplete(status.byte_size))
        }
    }
}

/// Remove a session together with its partial bytes
async fn abandon_session(state: &AppState, session: &mut UploadSession) {
    session.mark_abandoned();
    state.sessions.remove(&session.upload_identifier);

    if let Err(e) = state.storage.clean(&session.upload_identifier).await {
        warn!(
            upload_identifier = %session.upload_identifier,
            error = %e,
            "Failed to clean partial upload"
        );
    }
}

/// Build the `308 Resume Incomplete` response.
///
/// Carries `Range: bytes=0-<last>` when any bytes are stored and always an
/// explicit `Content-Length: 0`.
pub(super) fn resume_incomplete(bytes_stored: u64) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::PERMANENT_REDIRECT)
        .header(header::CONTENT_LENGTH, 0);

    if bytes_stored > 0 {
        response = response.header(header::RANGE, format!("bytes=0-{}", bytes_stored - 1));
    }

    response
        .body(Body::empty())
        .expect("valid resume response")
}
