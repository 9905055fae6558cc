//! The error taxonomy a package task can fail with.
//!
//! Every variant other than [`PackageError::BadRequest`] and
//! [`PackageError::NotAuthorized`] is caught once at the task boundary in
//! [`crate::task`], recorded via [`crate::stats`], and re-raised to the
//! worker pool, which logs it and moves on.

use std::fmt;

/// The kind of failure a request or a running task can produce.
#[derive(Debug)]
pub enum PackageError {
    /// Schema violation: missing required field or malformed JSON filter.
    /// Surfaced at ingress as 400.
    BadRequest(String),
    /// Bad or missing shared secret. Surfaced at ingress as 401.
    NotAuthorized,
    /// Non-2xx or network failure talking to the catalog or a fetched URL.
    UpstreamTransport(String),
    /// The external ZIP command exited non-zero.
    ArchiveError(String),
    /// Email delivery failed; the archive remains cached and the
    /// requester is not notified.
    SmtpError(String),
    /// Anything else.
    Internal(String),
}

impl fmt::Display for PackageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            PackageError::NotAuthorized => write!(f, "not authorized"),
            PackageError::UpstreamTransport(msg) => write!(f, "upstream transport error: {msg}"),
            PackageError::ArchiveError(msg) => write!(f, "archive error: {msg}"),
            PackageError::SmtpError(msg) => write!(f, "smtp error: {msg}"),
            PackageError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PackageError {}

impl PackageError {
    /// The ingress-facing error code for this kind of failure, matching
    /// the JSON `error` field in the HTTP contract.
    pub fn code(&self) -> &'static str {
        match self {
            PackageError::BadRequest(_) => "BadRequestError",
            PackageError::NotAuthorized => "NotAuthorizedError",
            PackageError::UpstreamTransport(_) => "UpstreamTransportError",
            PackageError::ArchiveError(_) => "ArchiveError",
            PackageError::SmtpError(_) => "SMTPError",
            PackageError::Internal(_) => "InternalError",
        }
    }
}
