//! In-process registry of open upload sessions.
//!
//! Sessions are keyed by the upload identifier embedded in the upload URL.
//! The registry is a plain concurrent map: an upload that outlives the
//! process is resumed through its temp file, not through session state, so
//! nothing here needs to survive a restart.

use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::UploadSession;

/// Concurrent session store keyed by upload identifier
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, UploadSession>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted session
    pub fn insert(&self, session: UploadSession) {
        debug!(
            upload_identifier = %session.upload_identifier,
            device_id = %session.metadata.device_id,
            "Registered upload session"
        );
        self.sessions
            .insert(session.upload_identifier.clone(), session);
    }

    /// Look up a session by its identifier, returning a snapshot
    pub fn get(&self, upload_identifier: &str) -> Option<UploadSession> {
        self.sessions
            .get(upload_identifier)
            .map(|entry| entry.clone())
    }

    /// Replace a session with an updated snapshot
    pub fn update(&self, session: &UploadSession) {
        self.sessions
            .insert(session.upload_identifier.clone(), session.clone());
    }

    /// Remove a session, returning it if it existed
    pub fn remove(&self, upload_identifier: &str) -> Option<UploadSession> {
        self.sessions
            .remove(upload_identifier)
            .map(|(_, session)| session)
    }

    /// Number of open sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are open
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop all sessions idle longer than `max_age`, returning how many went
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(max_age));
        let swept = before - self.sessions.len();

        if swept > 0 {
            info!(count = swept, "Swept expired upload sessions");
        }

        swept
    }
}
