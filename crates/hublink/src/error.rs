//! The classified transport error.
//!
//! Raw protocol failures are classified exactly once, where they are first
//! observed; from then on the retryable flag and the client-facing status
//! code travel with the error as data.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::status::HubStatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    Throttled,
    ServerBusy,
    InternalServerError,
    RequestEntityTooLarge,
    Io,
    Protocol,
    Other,
}

impl ErrorKind {
    /// Whether errors of this kind are worth a reconnection attempt by
    /// default. Individual errors may override the flag.
    #[must_use]
    fn default_retryable(self) -> bool {
        match self {
            Self::Throttled | Self::ServerBusy | Self::InternalServerError | Self::Io => true,
            Self::Unauthorized
            | Self::RequestEntityTooLarge
            | Self::Protocol
            | Self::Other => false,
        }
    }
}

/// A transport failure carrying its classification.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    kind: ErrorKind,
    message: String,
    retryable: bool,
    /// Per-device failures preserved when a multiplexed connection is
    /// rejected; empty for ordinary errors.
    device_errors: BTreeMap<String, TransportError>,
}

impl TransportError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            device_errors: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    #[must_use]
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Throttled, message)
    }

    #[must_use]
    pub fn server_busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerBusy, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalServerError, message)
    }

    #[must_use]
    pub fn too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RequestEntityTooLarge, message)
    }

    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    /// An authorization failure on a multiplexed connection, keeping each
    /// device's own failure visible to the caller managing the bundle.
    #[must_use]
    pub fn multiplexed_unauthorized(
        message: impl Into<String>,
        device_errors: BTreeMap<String, TransportError>,
    ) -> Self {
        let mut error = Self::unauthorized(message);
        error.device_errors = device_errors;
        error
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn set_retryable(&mut self, retryable: bool) {
        self.retryable = retryable;
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn device_errors(&self) -> &BTreeMap<String, TransportError> {
        &self.device_errors
    }

    /// Re-wraps this error with a new message, preserving the classification
    /// and any per-device failures.
    #[must_use]
    pub fn rewrap(&self, message: impl Into<String>) -> Self {
        Self {
            kind: self.kind,
            message: message.into(),
            retryable: self.retryable,
            device_errors: self.device_errors.clone(),
        }
    }

    #[must_use]
    pub fn status_code(&self) -> HubStatusCode {
        match self.kind {
            ErrorKind::Unauthorized => HubStatusCode::Unauthorized,
            ErrorKind::Throttled => HubStatusCode::Throttled,
            ErrorKind::ServerBusy => HubStatusCode::ServerBusy,
            ErrorKind::InternalServerError => HubStatusCode::InternalServerError,
            ErrorKind::RequestEntityTooLarge => HubStatusCode::RequestEntityTooLarge,
            ErrorKind::Io => HubStatusCode::IoError,
            ErrorKind::Protocol | ErrorKind::Other => HubStatusCode::Error,
        }
    }
}
