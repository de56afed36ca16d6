//! Error types for rigging.

use derive_more::{Display, Error, From};

/// Main error type for rigging operations.
#[derive(Debug, Display, Error, From)]
pub enum Error {
    /// A classified service error (non-2xx response translated by an error handler).
    #[display("service error {code} (HTTP {status}): {message}")]
    #[from(skip)]
    Service {
        /// HTTP status code.
        status: u16,
        /// Service error code, e.g. `ThrottlingException`.
        code: String,
        /// Error message.
        message: String,
        /// Response body, if available.
        #[error(not(source))]
        body: Option<bytes::Bytes>,
    },

    /// Transport-level failure (connect, reset, I/O).
    #[display("networking error: {_0}")]
    #[from(skip)]
    Networking(#[error(not(source))] String),

    /// Open or read timeout elapsed.
    #[display("request timeout")]
    #[from(skip)]
    Timeout,

    /// TLS/SSL errors.
    #[display("TLS error: {_0}")]
    #[from(skip)]
    Tls(#[error(not(source))] String),

    /// Declared `Content-Length` did not match the bytes received.
    #[display("truncated response: expected {expected} bytes, received {actual}")]
    #[from(skip)]
    TruncatedResponse {
        /// Bytes announced by the `Content-Length` header.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },

    /// Response checksum did not match.
    #[display("checksum mismatch: {_0}")]
    #[from(skip)]
    Checksum(#[error(not(source))] String),

    /// Endpoint discovery was required but no usable endpoint was found.
    #[display("endpoint discovery failed: {_0}")]
    #[from(skip)]
    EndpointDiscovery(#[error(not(source))] String),

    /// Credentials could not be resolved or refreshed.
    #[display("credentials error: {_0}")]
    #[from(skip)]
    Credentials(#[error(not(source))] String),

    /// Unknown or misused pipeline step.
    #[display("invalid step: {_0}")]
    #[from(skip)]
    InvalidStep(#[error(not(source))] String),

    /// Handler priority outside `0..=99`.
    #[display("invalid priority {_0}, expected a value in 0..=99")]
    #[from(skip)]
    InvalidPriority(#[error(not(source))] i32),

    /// A chain was requested from a pipeline without a send handler.
    #[display("no send handler registered")]
    #[from(skip)]
    MissingSendHandler,

    /// Invalid request configuration.
    #[display("invalid request: {_0}")]
    #[from(skip)]
    InvalidRequest(#[error(not(source))] String),

    /// JSON serialization error.
    #[display("JSON error: {_0}")]
    #[from]
    Json(serde_json::Error),

    /// URL parsing error.
    #[display("invalid URL: {_0}")]
    #[from]
    InvalidUrl(url::ParseError),
}

/// Result type alias using [`crate::Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a service error.
    #[must_use]
    pub fn service(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            status,
            code: code.into(),
            message: message.into(),
            body: None,
        }
    }

    /// Create a service error with the raw response body attached.
    #[must_use]
    pub fn service_with_body(
        status: u16,
        code: impl Into<String>,
        message: impl Into<String>,
        body: bytes::Bytes,
    ) -> Self {
        Self::Service {
            status,
            code: code.into(),
            message: message.into(),
            body: Some(body),
        }
    }

    /// Create a networking error.
    #[must_use]
    pub fn networking(message: impl Into<String>) -> Self {
        Self::Networking(message.into())
    }

    /// Create a TLS error.
    #[must_use]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls(message.into())
    }

    /// Create a checksum error.
    #[must_use]
    pub fn checksum(message: impl Into<String>) -> Self {
        Self::Checksum(message.into())
    }

    /// Create an endpoint discovery error.
    #[must_use]
    pub fn endpoint_discovery(message: impl Into<String>) -> Self {
        Self::EndpointDiscovery(message.into())
    }

    /// Create a credentials error.
    #[must_use]
    pub fn credentials(message: impl Into<String>) -> Self {
        Self::Credentials(message.into())
    }

    /// Create an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Returns `true` if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Returns `true` for transport-level failures: networking, timeouts, TLS
    /// and truncated bodies.
    #[must_use]
    pub const fn is_networking(&self) -> bool {
        matches!(
            self,
            Self::Networking(_) | Self::Timeout | Self::Tls(_) | Self::TruncatedResponse { .. }
        )
    }

    /// Returns `true` if this is a checksum error.
    #[must_use]
    pub const fn is_checksum(&self) -> bool {
        matches!(self, Self::Checksum(_))
    }

    /// Returns the HTTP status code if this is a service error.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the service error code if this is a service error.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Returns the service error message if this is a service error.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Service { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Returns `true` if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|s| (500..600).contains(&s))
    }

    /// Returns the response body if this is a service error with a body.
    #[must_use]
    pub fn body(&self) -> Option<&bytes::Bytes> {
        match self {
            Self::Service { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}
