//! Application state management.
//!
//! This module defines the shared application state that is accessible
//! from all request handlers via Axum's State extractor.
//!
//! # Usage
//!
//! ```rust,ignore
//! async fn handler(State(state): State<AppState>) -> impl IntoResponse {
//!     let bytes = state.storage.bytes_uploaded(&id).await?;
//!     // ...
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::services::storage::{self, MeasurementStorage};
use crate::services::SessionRegistry;

/// Shared application state
///
/// This struct holds all shared resources that handlers need access to.
/// It's cheap to clone and cloned into each request handler.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,

    /// Open upload sessions
    pub sessions: Arc<SessionRegistry>,

    /// Storage backend for partial and finalized uploads
    pub storage: Arc<dyn MeasurementStorage>,
}

impl AppState {
    /// Create a new application state
    ///
    /// # Errors
    /// Returns error if the configured storage backend cannot be initialized
    pub async fn new(config: Config) -> Result<Self> {
        let storage = storage::build_storage(&config).await?;

        Ok(Self {
            config: Arc::new(config),
            sessions: Arc::new(SessionRegistry::new()),
            storage,
        })
    }

    /// Get the base URL for upload URLs
    pub fn base_url(&self) -> &str {
        &self.config.server.base_url
    }

    /// Get the base path the API is mounted under
    pub fn http_endpoint(&self) -> &str {
        &self.config.server.http_endpoint
    }

    /// Get the maximum accepted chunk payload size
    pub fn payload_limit(&self) -> u64 {
        self.config.upload.measurement_payload_limit
    }

    /// Get the inactivity window after which uploads are swept
    pub fn upload_expiration(&self) -> Duration {
        self.config.upload.expiration()
    }

    /// Path of the partial file for an upload identifier
    pub fn temp_path(&self, upload_identifier: &str) -> PathBuf {
        self.config.upload.upload_folder.join(upload_identifier)
    }

    /// Absolute upload URL for a measurement session token
    pub fn measurement_upload_url(&self, upload_identifier: &str) -> String {
        format!(
            "{}{}/measurements/({})/",
            self.base_url(),
            self.http_endpoint(),
            upload_identifier
        )
    }

    /// Absolute upload URL for an attachment session token
    pub fn attachment_upload_url(
        &self,
        device_id: &str,
        measurement_id: &str,
        upload_identifier: &str,
    ) -> String {
        format!(
            "{}{}/measurements/{}/{}/attachments/({})/",
            self.base_url(),
            self.http_endpoint(),
            device_id,
            measurement_id,
            upload_identifier
        )
    }

    /// Run one janitor pass: sweep abandoned partial files, then the
    /// sessions that went idle. Returns `(files, sessions)` swept.
    pub async fn run_janitor_sweep(&self) -> (usize, usize) {
        let max_age = self.upload_expiration();

        let files = match self.storage.sweep_expired(max_age).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Janitor sweep of partial uploads failed");
                0
            }
        };

        let sessions = self.sessions.sweep_expired(max_age);

        (files, sessions)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("sessions", &self.sessions.len())
            .field("storage", &"<MeasurementStorage>")
            .finish()
    }
}
