//! Typed download errors and result combinators.
//!
//! Every fallible engine operation returns `DownloadResult<T>`; control flow
//! uses combinators (`map`, `and_then`, [`all_succeeded`]) instead of panics,
//! so errors can be classified and reported per task or per worker.

use std::fmt;
use std::io;

/// Classification of a download failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadErrorCode {
    /// URL could not be parsed or the HEAD probe failed.
    InvalidUrl,
    /// Target directory (or another required path) does not exist.
    PathNotFound,
    /// Target file already exists and cannot be overwritten.
    FileAlreadyExists,
    /// Server rejected or ignored a byte-range request.
    RangeNotSatisfiable,
    /// HTTP transport or status failure past retries.
    HttpError,
    /// Disk read/write/delete failed.
    DiskOperationFailed,
    /// Filesystem permission denied.
    PermissionDenied,
    /// Required argument missing or an operation hit an incompatible state.
    NullReference,
    /// Value outside its valid domain (also covers byte-accounting invariant
    /// violations).
    ArgumentOutOfRange,
    /// Task or worker lookup by id found nothing.
    ThreadNotFound,
    /// Operation interrupted by cancellation.
    ThreadCancelled,
    /// Worker or task concurrency limit exceeded.
    ThreadMaxExceeded,
    /// OS-level worker spawn failed.
    ThreadCreationFailed,
    /// Anything the engine could not classify.
    UnexpectedOrUnknownException,
}

impl fmt::Display for DownloadErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownloadErrorCode::InvalidUrl => "invalid url",
            DownloadErrorCode::PathNotFound => "path not found",
            DownloadErrorCode::FileAlreadyExists => "file already exists",
            DownloadErrorCode::RangeNotSatisfiable => "range not satisfiable",
            DownloadErrorCode::HttpError => "http error",
            DownloadErrorCode::DiskOperationFailed => "disk operation failed",
            DownloadErrorCode::PermissionDenied => "permission denied",
            DownloadErrorCode::NullReference => "null reference",
            DownloadErrorCode::ArgumentOutOfRange => "argument out of range",
            DownloadErrorCode::ThreadNotFound => "thread not found",
            DownloadErrorCode::ThreadCancelled => "thread cancelled",
            DownloadErrorCode::ThreadMaxExceeded => "thread max exceeded",
            DownloadErrorCode::ThreadCreationFailed => "thread creation failed",
            DownloadErrorCode::UnexpectedOrUnknownException => "unexpected error",
        };
        f.write_str(name)
    }
}

/// A download failure: a [`DownloadErrorCode`] plus a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DownloadError {
    /// Failure classification.
    pub code: DownloadErrorCode,
    /// What went wrong, with enough context to act on.
    pub message: String,
}

impl DownloadError {
    pub fn new(code: DownloadErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorCode::InvalidUrl, message)
    }

    pub fn http(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorCode::HttpError, message)
    }

    pub fn disk(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorCode::DiskOperationFailed, message)
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorCode::ArgumentOutOfRange, message)
    }

    /// An operation was invoked on a task or worker in an incompatible state
    /// (e.g. resuming a task that is not paused).
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorCode::NullReference, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorCode::ThreadNotFound, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorCode::ThreadCancelled, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorCode::UnexpectedOrUnknownException, message)
    }

    /// Maps an I/O error to a download error, promoting permission and
    /// missing-path failures to their dedicated codes.
    pub fn from_io(err: &io::Error, fallback: DownloadErrorCode, context: &str) -> Self {
        let code = match err.kind() {
            io::ErrorKind::PermissionDenied => DownloadErrorCode::PermissionDenied,
            io::ErrorKind::NotFound => DownloadErrorCode::PathNotFound,
            io::ErrorKind::AlreadyExists => DownloadErrorCode::FileAlreadyExists,
            _ => fallback,
        };
        Self::new(code, format!("{context}: {err}"))
    }
}

/// Result alias used across the engine.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Collects a sequence of results, short-circuiting on the first failure.
pub fn all_succeeded<T, I>(results: I) -> DownloadResult<Vec<T>>
where
    I: IntoIterator<Item = DownloadResult<T>>,
{
    let mut out = Vec::new();
    for result in results {
        out.push(result?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let e = DownloadError::http("GET / returned 503");
        assert_eq!(e.to_string(), "http error: GET / returned 503");
    }

    #[test]
    fn all_succeeded_collects_in_order() {
        let results = vec![Ok(1), Ok(2), Ok(3)];
        assert_eq!(all_succeeded(results).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn all_succeeded_short_circuits_on_first_failure() {
        let results: Vec<DownloadResult<u32>> = vec![
            Ok(1),
            Err(DownloadError::http("first")),
            Err(DownloadError::disk("second")),
        ];
        let err = all_succeeded(results).unwrap_err();
        assert_eq!(err.code, DownloadErrorCode::HttpError);
        assert_eq!(err.message, "first");
    }

    #[test]
    fn from_io_promotes_permission_denied() {
        let io = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let e = DownloadError::from_io(&io, DownloadErrorCode::DiskOperationFailed, "open x");
        assert_eq!(e.code, DownloadErrorCode::PermissionDenied);
        assert!(e.message.contains("open x"));
    }

    #[test]
    fn from_io_keeps_fallback_for_other_kinds() {
        let io = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let e = DownloadError::from_io(&io, DownloadErrorCode::DiskOperationFailed, "write y");
        assert_eq!(e.code, DownloadErrorCode::DiskOperationFailed);
    }
}
