//! Error types for the capfs protocol

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by capability operations
///
/// Only structural errors carry detail. Anything that originates from a
/// host I/O failure is reported as [`FsError::OpenFailed`] so that host
/// paths never cross the capability boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("illegal file name")]
    IllegalFileName,

    #[error("open failed")]
    OpenFailed,

    #[error("not implemented")]
    NotImplemented,

    #[error("stream received too many entries")]
    TooManyEntries,

    #[error("no such file or directory")]
    NotFound,

    #[error("malformed capability token: {0}")]
    Decode(String),

    #[error("stream closed")]
    Closed,

    #[error("disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// Censor a host I/O error before it crosses the capability boundary.
    ///
    /// Not-found is structural (the caller supplied the name), everything
    /// else collapses to `OpenFailed`.
    pub fn censor(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound,
            _ => FsError::OpenFailed,
        }
    }
}

impl From<bincode::Error> for FsError {
    fn from(e: bincode::Error) -> Self {
        FsError::Protocol(e.to_string())
    }
}

/// Wire error codes (sent over network)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    // Argument errors (0-99)
    InvalidArgument = 1,
    IllegalFileName = 2,
    NotImplemented = 3,

    // File errors (100-199)
    OpenFailed = 100,
    NotFound = 101,

    // Stream errors (200-299)
    TooManyEntries = 200,
    Closed = 201,

    // Connection errors (400-499)
    Decode = 400,
    Disconnected = 401,
    ProtocolError = 402,
}

impl From<&FsError> for ErrorCode {
    fn from(e: &FsError) -> Self {
        match e {
            FsError::InvalidArgument => ErrorCode::InvalidArgument,
            FsError::IllegalFileName => ErrorCode::IllegalFileName,
            FsError::OpenFailed => ErrorCode::OpenFailed,
            FsError::NotImplemented => ErrorCode::NotImplemented,
            FsError::TooManyEntries => ErrorCode::TooManyEntries,
            FsError::NotFound => ErrorCode::NotFound,
            FsError::Decode(_) => ErrorCode::Decode,
            FsError::Closed => ErrorCode::Closed,
            FsError::Disconnected => ErrorCode::Disconnected,
            FsError::Protocol(_) => ErrorCode::ProtocolError,
        }
    }
}

/// Map error code to libc errno
impl ErrorCode {
    pub fn to_errno(self) -> i32 {
        match self {
            ErrorCode::InvalidArgument => libc::EINVAL,
            ErrorCode::IllegalFileName => libc::EINVAL,
            ErrorCode::NotImplemented => libc::ENOSYS,
            ErrorCode::OpenFailed => libc::EIO,
            ErrorCode::NotFound => libc::ENOENT,
            ErrorCode::TooManyEntries => libc::EOVERFLOW,
            ErrorCode::Closed => libc::EPIPE,
            ErrorCode::Disconnected => libc::ENOTCONN,
            ErrorCode::Decode | ErrorCode::ProtocolError => libc::EPROTO,
        }
    }
}

/// Error as it travels in a `Return` message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&FsError> for ErrorMessage {
    fn from(e: &FsError) -> Self {
        let message = match e {
            FsError::Decode(m) | FsError::Protocol(m) => m.clone(),
            _ => String::new(),
        };
        Self {
            code: e.into(),
            message,
        }
    }
}

impl From<ErrorMessage> for FsError {
    fn from(m: ErrorMessage) -> Self {
        match m.code {
            ErrorCode::InvalidArgument => FsError::InvalidArgument,
            ErrorCode::IllegalFileName => FsError::IllegalFileName,
            ErrorCode::NotImplemented => FsError::NotImplemented,
            ErrorCode::OpenFailed => FsError::OpenFailed,
            ErrorCode::NotFound => FsError::NotFound,
            ErrorCode::TooManyEntries => FsError::TooManyEntries,
            ErrorCode::Closed => FsError::Closed,
            ErrorCode::Decode => FsError::Decode(m.message),
            ErrorCode::Disconnected => FsError::Disconnected,
            ErrorCode::ProtocolError => FsError::Protocol(m.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_roundtrip() {
        let errors = [
            FsError::InvalidArgument,
            FsError::IllegalFileName,
            FsError::OpenFailed,
            FsError::NotImplemented,
            FsError::TooManyEntries,
            FsError::NotFound,
            FsError::Decode("bad token".into()),
            FsError::Closed,
            FsError::Disconnected,
            FsError::Protocol("unexpected reply".into()),
        ];

        for err in errors {
            let msg = ErrorMessage::from(&err);
            assert_eq!(FsError::from(msg), err);
        }
    }

    #[test]
    fn test_censor_hides_host_detail() {
        let err = std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "/var/run/secret/x: permission denied",
        );
        let censored = FsError::censor(&err);
        assert_eq!(censored, FsError::OpenFailed);
        assert!(!ErrorMessage::from(&censored).message.contains("secret"));

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "/var/run/secret/x");
        assert_eq!(FsError::censor(&missing), FsError::NotFound);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ErrorCode::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(ErrorCode::OpenFailed.to_errno(), libc::EIO);
        assert_eq!(ErrorCode::IllegalFileName.to_errno(), libc::EINVAL);
    }
}
