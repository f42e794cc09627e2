//! Upload session model for resumable uploads.
//!
//! A session binds an upload identifier to the declared metadata, the
//! uploading principal and the partial bytes on disk. The identifier doubles
//! as the session token embedded in the upload URL, so no cookie or header
//! state is needed between requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::models::metadata::{AttachmentInventory, FileType, RequestMetaData};

/// The authenticated user an upload is attributed to.
///
/// Token validation happens before the core runs; handlers only ever see
/// this resolved form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
}

impl Principal {
    /// Principal used when authentication is disabled
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            username: "anonymous".to_string(),
        }
    }
}

/// Lifecycle state of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Pre-request accepted, no bytes received yet
    OpenEmpty,
    /// At least one chunk accepted, more outstanding
    OpenPartial,
    /// All bytes received, finalize in flight
    Committing,
    /// Finalize succeeded; the stored object exists
    Committed,
    /// Swept by the janitor or given up after a terminal failure
    Abandoned,
}

impl SessionState {
    /// Whether the session accepts further chunks
    pub fn can_accept_chunks(&self) -> bool {
        matches!(self, Self::OpenEmpty | Self::OpenPartial)
    }

    /// Whether the session has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Abandoned)
    }

    /// Stable string form for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenEmpty => "open_empty",
            Self::OpenPartial => "open_partial",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// One resumable upload in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Random 128-bit identifier, exposed as 32 lowercase hex characters
    pub upload_identifier: String,

    /// Envelope declared by the pre-request (immutable for the session)
    pub metadata: RequestMetaData,

    /// Attachment inventory; `None` for measurement uploads
    pub attachment: Option<AttachmentInventory>,

    /// Kind of binary this session receives
    pub file_type: FileType,

    /// User the upload is attributed to
    pub principal: Principal,

    /// Current lifecycle state
    pub state: SessionState,

    /// Path of the partial file once the first chunk landed
    pub upload_path: Option<PathBuf>,

    /// When the pre-request was accepted
    pub accepted_at: DateTime<Utc>,

    /// Last successful byte append
    pub last_touched: DateTime<Utc>,
}

impl UploadSession {
    /// Create a new session with a fresh random identifier
    pub fn new(
        metadata: RequestMetaData,
        attachment: Option<AttachmentInventory>,
        file_type: FileType,
        principal: Principal,
    ) -> Self {
        let now = Utc::now();
        Self {
            upload_identifier: Uuid::new_v4().as_simple().to_string(),
            metadata,
            attachment,
            file_type,
            principal,
            state: SessionState::OpenEmpty,
            upload_path: None,
            accepted_at: now,
            last_touched: now,
        }
    }

    /// Record activity so the janitor leaves the session alone
    pub fn touch(&mut self) {
        self.last_touched = Utc::now();
    }

    /// Whether the session has been idle longer than `max_age`
    pub fn is_expired(&self, max_age: Duration) -> bool {
        Utc::now()
            .signed_duration_since(self.last_touched)
            .to_std()
            .map(|idle| idle > max_age)
            .unwrap_or(false)
    }

    /// Mark that a chunk was accepted but bytes are still outstanding
    pub fn mark_partial(&mut self, path: PathBuf) {
        self.state = SessionState::OpenPartial;
        self.upload_path = Some(path);
        self.touch();
    }

    /// Mark that the final chunk arrived and finalize is running
    pub fn mark_committing(&mut self) {
        self.state = SessionState::Committing;
        self.touch();
    }

    /// Mark that finalize succeeded
    pub fn mark_committed(&mut self) {
        self.state = SessionState::Committed;
        self.touch();
    }

    /// Mark the session as given up
    pub fn mark_abandoned(&mut self) {
        self.state = SessionState::Abandoned;
        self.touch();
    }

    /// Forget the partial file, e.g. after the janitor removed it underneath
    pub fn reset_upload_path(&mut self) {
        self.upload_path = None;
        self.state = SessionState::OpenEmpty;
    }

    /// Extract the upload identifier from its URL form.
    ///
    /// The token travels inside literal parentheses as a cookieless session
    /// marker: `(abcdef0123456789abcdef0123456789)`. Anything else is not a
    /// session token.
    pub fn parse_token(segment: &str) -> Option<&str> {
        let token = segment.strip_prefix('(')?.strip_suffix(')')?;
        if token.len() == 32
            && token
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            Some(token)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::tests::valid_metadata;

    fn test_session() -> UploadSession {
        UploadSession::new(
            valid_metadata(),
            None,
            FileType::Measurement,
            Principal::anonymous(),
        )
    }

    #[test]
    fn test_identifier_shape() {
        let session = test_session();
        assert_eq!(session.upload_identifier.len(), 32);
        assert!(session
            .upload_identifier
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    }

    #[test]
    fn test_state_transitions() {
        let mut session = test_session();
        assert_eq!(session.state, SessionState::OpenEmpty);
        assert!(session.state.can_accept_chunks());
        assert!(!session.state.is_terminal());

        session.mark_partial(PathBuf::from("/tmp/x"));
        assert_eq!(session.state, SessionState::OpenPartial);
        assert!(session.state.can_accept_chunks());

        session.mark_committing();
        assert!(!session.state.can_accept_chunks());
        assert!(!session.state.is_terminal());

        session.mark_committed();
        assert!(session.state.is_terminal());
    }

    #[test]
    fn test_abandon_is_terminal() {
        let mut session = test_session();
        session.mark_abandoned();
        assert!(session.state.is_terminal());
        assert!(!session.state.can_accept_chunks());
    }

    #[test]
    fn test_reset_upload_path() {
        let mut session = test_session();
        session.mark_partial(PathBuf::from("/tmp/x"));
        session.reset_upload_path();
        assert_eq!(session.state, SessionState::OpenEmpty);
        assert!(session.upload_path.is_none());
    }

    #[test]
    fn test_expiry() {
        let mut session = test_session();
        assert!(!session.is_expired(Duration::from_secs(60)));

        session.last_touched = Utc::now() - chrono::Duration::seconds(120);
        assert!(session.is_expired(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_token() {
        let token = "abcdef0123456789abcdef0123456789";
        let segment = format!("({})", token);
        assert_eq!(UploadSession::parse_token(&segment), Some(token));

        // Round-trips a generated identifier
        let session = test_session();
        let segment = format!("({})", session.upload_identifier);
        assert_eq!(
            UploadSession::parse_token(&segment),
            Some(session.upload_identifier.as_str())
        );
    }

    #[test]
    fn test_parse_token_rejects_malformed() {
        assert!(UploadSession::parse_token("abcdef0123456789abcdef0123456789").is_none());
        assert!(UploadSession::parse_token("(abc)").is_none());
        assert!(UploadSession::parse_token("(ABCDEF0123456789ABCDEF0123456789)").is_none());
        assert!(UploadSession::parse_token("(zzzzzz0123456789abcdef0123456789)").is_none());
        assert!(UploadSession::parse_token("").is_none());
    }
}
