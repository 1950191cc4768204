//! Error taxonomy shared by the registry, coordinator, ledger, and facade.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the station core can surface to a caller.
#[derive(Debug, Error)]
pub enum StationError {
    /// Unknown session token or user.
    #[error("{what} not found")]
    NotFound { what: &'static str },

    /// The session TTL has elapsed.
    #[error("session expired")]
    Expired,

    /// Mobile-side bind attempt on a session that is no longer pending.
    #[error("session token has already been used")]
    AlreadyUsed,

    /// Registry-level single-use violation (status precondition failed).
    #[error("session is already bound")]
    AlreadyBound,

    /// Unknown email or wrong secret. The two causes are never distinguished.
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("unrecognized material: {0}")]
    InvalidMaterial(String),

    #[error("weight must be a positive number of kilograms, got {0}")]
    InvalidWeight(f64),

    /// Station-side operation that needs a known identity.
    #[error("no user connected, scan the QR code or log in first")]
    NotAuthenticated,

    /// Station-side operation that needs a live pairing session.
    #[error("no active session, request a session token first")]
    NoActiveSession,

    #[error("email '{0}' is already registered")]
    EmailTaken(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("QR rendering failed: {0}")]
    Qr(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Stable, serializable discriminant of a [`StationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Expired,
    AlreadyUsed,
    AlreadyBound,
    InvalidCredentials,
    InvalidMaterial,
    InvalidWeight,
    NotAuthenticated,
    NoActiveSession,
    EmailTaken,
    InvalidInput,
    QrError,
    StorageError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::AlreadyUsed => "already_used",
            Self::AlreadyBound => "already_bound",
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidMaterial => "invalid_material",
            Self::InvalidWeight => "invalid_weight",
            Self::NotAuthenticated => "not_authenticated",
            Self::NoActiveSession => "no_active_session",
            Self::EmailTaken => "email_taken",
            Self::InvalidInput => "invalid_input",
            Self::QrError => "qr_error",
            Self::StorageError => "storage_error",
        }
    }
}

impl StationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Expired => ErrorKind::Expired,
            Self::AlreadyUsed => ErrorKind::AlreadyUsed,
            Self::AlreadyBound => ErrorKind::AlreadyBound,
            Self::InvalidCredentials => ErrorKind::InvalidCredentials,
            Self::InvalidMaterial(_) => ErrorKind::InvalidMaterial,
            Self::InvalidWeight(_) => ErrorKind::InvalidWeight,
            Self::NotAuthenticated => ErrorKind::NotAuthenticated,
            Self::NoActiveSession => ErrorKind::NoActiveSession,
            Self::EmailTaken(_) => ErrorKind::EmailTaken,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Qr(_) => ErrorKind::QrError,
            Self::Storage(_) => ErrorKind::StorageError,
        }
    }

    pub(crate) fn session_not_found() -> Self {
        Self::NotFound { what: "session" }
    }

    pub(crate) fn user_not_found() -> Self {
        Self::NotFound { what: "user" }
    }

    /// Structured form handed to callers across the process boundary.
    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// A failure as seen by station UI and mobile clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&StationError> for Failure {
    fn from(err: &StationError) -> Self {
        err.to_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_match_serde() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::AlreadyUsed,
            ErrorKind::InvalidCredentials,
            ErrorKind::StorageError,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn failure_carries_kind_and_message() {
        let failure = StationError::InvalidMaterial("styrofoam".into()).to_failure();
        assert_eq!(failure.kind, ErrorKind::InvalidMaterial);
        assert!(failure.message.contains("styrofoam"));
    }
}
