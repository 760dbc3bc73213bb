//! Error types for attest-core operations.
//!
//! Compliance outcomes (a record whose validation status is FAILED, a session
//! rejected by the fraud rules) are not errors and never appear here.

// ═══════════════════════════════════════════════════════════════════════════════
// General Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors raised by the pure library code.
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    #[error("Signing key malformed: {0}")]
    KeyMalformed(String),

    #[error("Canonical serialization failed: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid fixed-point value: {0}")]
    InvalidFixedPoint(String),
}

/// Convenience type alias for Results using AttestError.
pub type Result<T> = std::result::Result<T, AttestError>;

impl From<AttestError> for String {
    fn from(err: AttestError) -> String {
        err.to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ingestion Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Reasons an inbound webhook or heartbeat is refused.
///
/// Every variant is logged by the caller; nothing here is retried.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IngestionError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Webhook signature did not match")]
    BadSignature,

    #[error("Webhook timestamp outside tolerance: {timestamp}")]
    StaleTimestamp { timestamp: String },

    #[error("Webhook secret is not configured")]
    SecretNotConfigured,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session {session_id} is already {status}")]
    SessionFinalized { session_id: String, status: String },

    #[error("Ingestion exceeded its processing deadline")]
    DeadlineExceeded,

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl IngestionError {
    /// Stable wire code for IPC responses.
    pub fn code(&self) -> &'static str {
        match self {
            IngestionError::MalformedPayload(_) => "malformed_payload",
            IngestionError::BadSignature => "bad_signature",
            IngestionError::StaleTimestamp { .. } => "stale_timestamp",
            IngestionError::SecretNotConfigured => "webhook_not_configured",
            IngestionError::UnknownSession(_) => "unknown_session",
            IngestionError::SessionFinalized { .. } => "session_finalized",
            IngestionError::DeadlineExceeded => "deadline_exceeded",
            IngestionError::Storage(_) => "storage_error",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Generation Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures of verification record generation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Verification record already exists for session {session_id}: {record_id}")]
    AlreadyExists {
        session_id: String,
        record_id: String,
    },

    #[error("Session {session_id} is not eligible for a record: {reason}")]
    NotEligible { session_id: String, reason: String },

    #[error("Chain scope {scope} advanced concurrently")]
    ChainConflict { scope: String },

    #[error("Record canonicalization failed: {0}")]
    Canonicalization(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl GenerationError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, GenerationError::AlreadyExists { .. })
    }
}

impl From<AttestError> for GenerationError {
    fn from(err: AttestError) -> Self {
        GenerationError::Canonicalization(err.to_string())
    }
}

impl From<String> for GenerationError {
    fn from(message: String) -> Self {
        GenerationError::Storage(message)
    }
}

impl From<String> for IngestionError {
    fn from(message: String) -> Self {
        IngestionError::Storage(message)
    }
}
