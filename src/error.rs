// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error envelope.
//!
//! Every layer in this crate (varint, pipe, framer, checksum, mux) returns
//! the same [`Error`] / [`Result`] pair. An [`Error`] pairs an [`ErrorKind`]
//! (the root cause, usable for pattern matching) with the name of the
//! operation and, where relevant, the device/layer involved.

use std::fmt;

/// Root cause of an [`Error`], independent of where it was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // ========================================================================
    // Data integrity errors
    // ========================================================================
    /// Bad hash, sequence gap, declared length over the safety ceiling,
    /// truncated body relative to its header, or a non-header escape
    /// sequence encountered during resync.
    Malformed,
    /// Declared or requested length exceeded the configured safety ceiling.
    TooBig,

    // ========================================================================
    // Lifecycle errors
    // ========================================================================
    /// The pipe, multiplexer, or stream handle has been closed.
    Closed,

    // ========================================================================
    // Transport errors
    // ========================================================================
    /// Inner reader returned zero bytes before the expected data was fully read.
    UnexpectedEof,
    /// Inner writer wrote fewer bytes than requested.
    ShortWrite,
    /// Inner reader or writer returned `Ok(0)` repeatedly without making progress.
    NoProgress,
    /// A send to a multiplex stream channel exceeded its configured deadline.
    DeadlineExceeded,

    // ========================================================================
    // Programmer errors
    // ========================================================================
    /// Internal misuse of the library (e.g. a nil/empty error wrapped as a cause).
    Usage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Malformed => write!(f, "malformed data"),
            ErrorKind::TooBig => write!(f, "length exceeds safety ceiling"),
            ErrorKind::Closed => write!(f, "closed"),
            ErrorKind::UnexpectedEof => write!(f, "unexpected end of stream"),
            ErrorKind::ShortWrite => write!(f, "short write"),
            ErrorKind::NoProgress => write!(f, "no progress"),
            ErrorKind::DeadlineExceeded => write!(f, "deadline exceeded"),
            ErrorKind::Usage => write!(f, "usage error"),
        }
    }
}

/// Crate-wide error type: an [`ErrorKind`] plus the context needed to act on it.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    /// The logical operation in progress (e.g. `"frame read"`, `"pipe write"`).
    op: &'static str,
    /// Optional human-readable detail (device name, identifier, etc.).
    detail: Option<String>,
    /// The wrapped transport failure, if this error was caused by one.
    ///
    /// `Arc`-wrapped rather than a bare `io::Error` so that `Error` itself
    /// can be `Clone` — needed for the pipe's sticky close-error slot, which
    /// must hand the same error to every reader that observes a close.
    source: Option<std::sync::Arc<std::io::Error>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Error {
            kind: self.kind,
            op: self.op,
            detail: self.detail.clone(),
            source: self.source.clone(),
        }
    }
}

impl Error {
    /// Construct an error with no further detail.
    #[must_use]
    pub fn new(kind: ErrorKind, op: &'static str) -> Self {
        Error {
            kind,
            op,
            detail: None,
            source: None,
        }
    }

    /// Attach a human-readable detail string.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Wrap an underlying transport failure.
    #[must_use]
    pub fn from_io(op: &'static str, err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ErrorKind::UnexpectedEof,
            std::io::ErrorKind::WriteZero => ErrorKind::ShortWrite,
            _ => ErrorKind::NoProgress,
        };
        Error {
            kind,
            op,
            detail: None,
            source: Some(std::sync::Arc::new(err)),
        }
    }

    /// The root cause of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// `true` if this error's kind is `Closed`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.kind == ErrorKind::Closed
    }

    /// `true` if this error's kind is `Malformed`.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        self.kind == ErrorKind::Malformed
    }

    /// `true` if this error's kind is `DeadlineExceeded`.
    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        self.kind == ErrorKind::DeadlineExceeded
    }

    pub(crate) fn malformed(op: &'static str) -> Self {
        Error::new(ErrorKind::Malformed, op)
    }

    pub(crate) fn deadline_exceeded(op: &'static str) -> Self {
        Error::new(ErrorKind::DeadlineExceeded, op)
    }

    pub(crate) fn too_big(op: &'static str, len: usize, ceiling: usize) -> Self {
        Error::new(ErrorKind::TooBig, op)
            .with_detail(format!("length {len} exceeds safety ceiling {ceiling}"))
    }

    pub(crate) fn closed(op: &'static str) -> Self {
        Error::new(ErrorKind::Closed, op)
    }

    pub(crate) fn usage(op: &'static str, detail: impl Into<String>) -> Self {
        Error::new(ErrorKind::Usage, op).with_detail(detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.op, self.kind)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind {
            ErrorKind::Closed => std::io::ErrorKind::BrokenPipe,
            ErrorKind::UnexpectedEof => std::io::ErrorKind::UnexpectedEof,
            ErrorKind::TooBig | ErrorKind::Malformed => std::io::ErrorKind::InvalidData,
            ErrorKind::DeadlineExceeded => std::io::ErrorKind::TimedOut,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Convenient alias for results using the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_op_and_kind() {
        let err = Error::new(ErrorKind::Malformed, "frame read");
        assert_eq!(err.to_string(), "frame read: malformed data");
    }

    #[test]
    fn display_includes_detail() {
        let err = Error::too_big("frame read", 200_000_000, 134_217_728);
        assert!(err.to_string().contains("exceeds safety ceiling"));
    }

    #[test]
    fn is_closed_matches_kind() {
        let err = Error::closed("pipe read");
        assert!(err.is_closed());
        assert!(!err.is_malformed());
    }

    #[test]
    fn deadline_exceeded_roundtrips_through_io_error() {
        let err = Error::deadline_exceeded("mux stream delivery").with_detail("stream abc123");
        assert!(err.is_deadline_exceeded());
        let io_err: std::io::Error = err.into();
        assert_eq!(io_err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn io_error_roundtrips_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err = Error::from_io("frame read", io_err);
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
        assert!(std::error::Error::source(&err).is_some());
    }
}
