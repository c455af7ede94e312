//! # Error Taxonomy
//!
//! Two error types live side by side, deliberately:
//!
//! - [`ErrorCode`] is the wire-stable taxonomy from the command/response
//!   protocol. It is what callers see in a [`crate::command::types::Response`]
//!   and it must never be renamed or reordered without a wire migration.
//! - [`MkvError`] is the internal error type used by plumbing that does not
//!   cross the wire (storage I/O, MQTT transport, config validation). It
//!   carries richer context than a `Response` needs and is converted to an
//!   `ErrorCode` only at the boundary where a `Response` is built.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for internal (non-wire) fallible operations.
pub type Result<T> = std::result::Result<T, MkvError>;

/// Wire-stable error codes carried by [`crate::command::types::Response`].
///
/// Renaming or reordering these breaks every deployed client; treat this
/// enum as append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request, unknown op, bulk cardinality out of range, etc.
    InvalidRequest,
    /// Key/value/command exceeds a configured size limit.
    PayloadTooLarge,
    /// GET on an absent or tombstoned key.
    NotFound,
    /// Operation exceeded its timeout class or the broker ack window.
    Timeout,
    /// Not connected and the command could not be queued.
    Connection,
    /// Storage or I/O failure; the command did not produce durable state.
    InternalError,
}

impl ErrorCode {
    /// Default human-readable message for a code with no extra context.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid request",
            ErrorCode::PayloadTooLarge => "payload too large",
            ErrorCode::NotFound => "not found",
            ErrorCode::Timeout => "operation timed out",
            ErrorCode::Connection => "not connected",
            ErrorCode::InternalError => "internal error",
        }
    }
}

/// Internal error type for storage, transport, and configuration failures.
///
/// Modeled after the teacher client's `Error` enum: a flat set of
/// `thiserror` variants with constructor helpers, rather than a deep
/// hierarchy of nested error types.
#[derive(Error, Debug)]
pub enum MkvError {
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("mqtt transport error: {message}")]
    Transport { message: String },

    #[error("serialization error: {message}")]
    Codec { message: String },

    #[error("operation timed out: {message}")]
    Timeout { message: String },

    #[error("not connected: {message}")]
    NotConnected { message: String },

    #[error("queue storage error: {message}")]
    QueueStorage { message: String },

    #[error("request rejected: {message}")]
    InvalidRequest { message: String },

    #[error("payload too large: {message}")]
    PayloadTooLarge { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },
}

impl MkvError {
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        MkvError::InvalidConfig { message: msg.into() }
    }
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        MkvError::Storage { message: msg.into() }
    }
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        MkvError::Transport { message: msg.into() }
    }
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        MkvError::Codec { message: msg.into() }
    }
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        MkvError::Timeout { message: msg.into() }
    }
    pub fn not_connected<S: Into<String>>(msg: S) -> Self {
        MkvError::NotConnected { message: msg.into() }
    }
    pub fn queue_storage<S: Into<String>>(msg: S) -> Self {
        MkvError::QueueStorage { message: msg.into() }
    }
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        MkvError::InvalidRequest { message: msg.into() }
    }
    pub fn payload_too_large<S: Into<String>>(msg: S) -> Self {
        MkvError::PayloadTooLarge { message: msg.into() }
    }
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        MkvError::NotFound { message: msg.into() }
    }

    /// Map to the wire-stable code surfaced in a `Response`.
    pub fn code(&self) -> ErrorCode {
        match self {
            MkvError::InvalidConfig { .. } => ErrorCode::InvalidRequest,
            MkvError::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            MkvError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            MkvError::NotFound { .. } => ErrorCode::NotFound,
            MkvError::Timeout { .. } => ErrorCode::Timeout,
            MkvError::NotConnected { .. } => ErrorCode::Connection,
            MkvError::Storage { .. } | MkvError::QueueStorage { .. } | MkvError::Codec { .. } => {
                ErrorCode::InternalError
            }
            MkvError::Transport { .. } => ErrorCode::InternalError,
        }
    }
}

impl From<sled::Error> for MkvError {
    fn from(err: sled::Error) -> Self {
        MkvError::Storage { message: err.to_string() }
    }
}

impl From<serde_cbor::Error> for MkvError {
    fn from(err: serde_cbor::Error) -> Self {
        MkvError::Codec { message: err.to_string() }
    }
}

impl From<rusqlite::Error> for MkvError {
    fn from(err: rusqlite::Error) -> Self {
        MkvError::QueueStorage { message: err.to_string() }
    }
}

impl From<rumqttc::ClientError> for MkvError {
    fn from(err: rumqttc::ClientError) -> Self {
        MkvError::Transport { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_maps_as_expected() {
        assert_eq!(MkvError::not_found("k").code(), ErrorCode::NotFound);
        assert_eq!(MkvError::payload_too_large("v").code(), ErrorCode::PayloadTooLarge);
        assert_eq!(MkvError::not_connected("x").code(), ErrorCode::Connection);
        assert_eq!(MkvError::storage("x").code(), ErrorCode::InternalError);
    }

    #[test]
    fn error_code_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::PayloadTooLarge).unwrap();
        assert_eq!(json, "\"PAYLOAD_TOO_LARGE\"");
    }
}
