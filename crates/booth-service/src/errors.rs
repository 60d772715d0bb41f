//! Booth service error types.
//!
//! Error types map to numeric client error codes sent over the realtime
//! transport. Internal details are logged server-side but not exposed to
//! clients.

use thiserror::Error;

/// Booth service error type.
///
/// Maps to client error codes:
/// - `Validation`: `INVALID_REQUEST` (1)
/// - `AuthToken`: `UNAUTHORIZED` (2)
/// - `PermissionDenied`: `FORBIDDEN` (3)
/// - `NotFound`: `NOT_FOUND` (4)
/// - `AdvanceInProgress`: `CONFLICT` (5)
/// - Store, Bus, Serialization, Config, Internal, EmptyPlaylist: `INTERNAL_ERROR` (6)
/// - `StoreInconsistency`: `RETRY` (8)
#[derive(Debug, Error)]
pub enum BoothError {
    /// Shared store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Event bus publish or subscribe failed.
    #[error("Event bus error: {0}")]
    Bus(String),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request rejected before any mutation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Requester lacks the capability for this operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Referenced user or entry does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another process holds the advance lease.
    #[error("Advance already in progress")]
    AdvanceInProgress,

    /// The candidate performer has nothing to play.
    ///
    /// Only produced and consumed inside the advance loop.
    #[error("Playlist is empty")]
    EmptyPlaylist,

    /// A confirmation re-read disagreed with the intended write.
    #[error("Store inconsistency: {0}")]
    StoreInconsistency(String),

    /// Handshake token could not be redeemed.
    #[error("Auth token error: {0}")]
    AuthToken(AuthTokenError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Handshake token failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthTokenError {
    /// Token does not have the expected shape; rejected without a store lookup.
    #[error("Invalid token")]
    Malformed,

    /// Token expired or was already redeemed.
    #[error("Token not found")]
    NotFound,

    /// Token belongs to a banned participant.
    #[error("You have been banned")]
    Banned,

    /// Connection stayed a guest past the authentication window.
    #[error("Authentication window elapsed")]
    WindowElapsed,
}

impl BoothError {
    /// Returns the client error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            BoothError::Validation(_) => 1,       // INVALID_REQUEST
            BoothError::AuthToken(_) => 2,        // UNAUTHORIZED
            BoothError::PermissionDenied(_) => 3, // FORBIDDEN
            BoothError::NotFound(_) => 4,         // NOT_FOUND
            BoothError::AdvanceInProgress => 5,   // CONFLICT
            BoothError::Store(_)
            | BoothError::Bus(_)
            | BoothError::Serialization(_)
            | BoothError::Config(_)
            | BoothError::EmptyPlaylist
            | BoothError::Internal(_) => 6, // INTERNAL_ERROR
            BoothError::StoreInconsistency(_) => 8, // RETRY
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            BoothError::Store(_)
            | BoothError::Bus(_)
            | BoothError::Serialization(_)
            | BoothError::Config(_)
            | BoothError::EmptyPlaylist
            | BoothError::Internal(_) => "An internal error occurred".to_string(),
            BoothError::AdvanceInProgress => {
                "Another advance is still in progress, please try again".to_string()
            }
            BoothError::StoreInconsistency(msg)
            | BoothError::Validation(msg)
            | BoothError::PermissionDenied(msg)
            | BoothError::NotFound(msg) => msg.clone(),
            BoothError::AuthToken(e) => e.to_string(),
        }
    }

    /// Whether the caller may simply try the same request again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BoothError::AdvanceInProgress | BoothError::StoreInconsistency(_)
        )
    }
}

impl From<AuthTokenError> for BoothError {
    fn from(err: AuthTokenError) -> Self {
        BoothError::AuthToken(err)
    }
}

impl From<serde_json::Error> for BoothError {
    fn from(err: serde_json::Error) -> Self {
        BoothError::Serialization(err.to_string())
    }
}
