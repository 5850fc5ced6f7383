//! Client-facing status codes reported through send callbacks.

/// Terminal status for one message or request, as surfaced to the
/// application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubStatusCode {
    /// The request completed with a response body.
    Ok,
    /// The request completed with no response body.
    OkEmpty,
    BadFormat,
    Unauthorized,
    Throttled,
    ServerBusy,
    InternalServerError,
    RequestEntityTooLarge,
    /// The message outlived its expiry before it could be sent.
    MessageExpired,
    /// The transport was closed while the message was still queued.
    MessageCancelledOnClose,
    IoError,
    Error,
}

impl HubStatusCode {
    /// Maps an HTTP response status to a hub status code.
    #[must_use]
    pub fn from_http_status(status: u16) -> Self {
        match status {
            200 => Self::Ok,
            204 => Self::OkEmpty,
            400 => Self::BadFormat,
            401 => Self::Unauthorized,
            413 => Self::RequestEntityTooLarge,
            429 => Self::Throttled,
            500 => Self::InternalServerError,
            503 => Self::ServerBusy,
            _ => Self::Error,
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::OkEmpty)
    }
}
