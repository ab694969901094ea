use ferry_proto::ResponseCode;
use std::{fmt, io};

/// Errors produced by the responder core.
#[derive(Debug)]
pub enum Error {
    /// Bulk I/O was aborted by the cancellation token.
    TransportCancelled,
    /// The bulk endpoint pair is gone (host detached, fd closed).
    TransportClosed(io::Error),
    /// The parser reached a short or zero-length packet. Expected at
    /// data-phase boundaries; an error everywhere else.
    EndOfTransmission,
    /// In-place bulk read into a destination that is not page-aligned.
    BufferNotAligned,
    /// A transfer delivered fewer or more bytes than the payload size.
    IncompleteTransfer { expected: u64, actual: u64 },
    /// The host violated the protocol; answer with the carried code.
    Protocol(ResponseCode),
    /// Filesystem failure, mapped onto a PTP response code for the host.
    Filesystem(io::Error),
    /// The embedding requested a stop.
    StopRequested,
}

impl Error {
    /// PTP response code to answer the current transaction with.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Error::Protocol(code) => *code,
            Error::Filesystem(err) => match err.kind() {
                io::ErrorKind::NotFound => ResponseCode::InvalidObjectHandle,
                io::ErrorKind::PermissionDenied => ResponseCode::AccessDenied,
                io::ErrorKind::AlreadyExists => ResponseCode::InvalidParameter,
                _ if err.raw_os_error() == Some(libc::ENOSPC) => ResponseCode::StoreFull,
                _ => ResponseCode::GeneralError,
            },
            Error::IncompleteTransfer { .. } => ResponseCode::IncompleteTransfer,
            _ => ResponseCode::GeneralError,
        }
    }

    /// True for the control-plane results that must escape the serve loop
    /// instead of being converted into a response.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::TransportCancelled | Error::TransportClosed(_) | Error::StopRequested
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TransportCancelled => write!(f, "bulk transfer cancelled"),
            Error::TransportClosed(err) => write!(f, "bulk transport closed: {err}"),
            Error::EndOfTransmission => write!(f, "end of transmission"),
            Error::BufferNotAligned => write!(f, "in-place read buffer is not page-aligned"),
            Error::IncompleteTransfer { expected, actual } => {
                write!(f, "incomplete transfer: {actual} of {expected} bytes")
            }
            Error::Protocol(code) => write!(f, "protocol violation ({:#06x})", u16::from(*code)),
            Error::Filesystem(err) => write!(f, "filesystem error: {err}"),
            Error::StopRequested => write!(f, "stop requested"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::TransportClosed(err) | Error::Filesystem(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Filesystem(err)
    }
}

impl From<ferry_proto::ProtoError> for Error {
    fn from(_: ferry_proto::ProtoError) -> Self {
        Error::Protocol(ResponseCode::InvalidParameter)
    }
}

/// Result alias used throughout the responder core.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_errors_map_to_ptp_codes() {
        let not_found = Error::Filesystem(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(not_found.response_code(), ResponseCode::InvalidObjectHandle);

        let denied = Error::Filesystem(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.response_code(), ResponseCode::AccessDenied);

        let full = Error::Filesystem(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(full.response_code(), ResponseCode::StoreFull);

        let other = Error::Filesystem(io::Error::other("boom"));
        assert_eq!(other.response_code(), ResponseCode::GeneralError);
    }

    #[test]
    fn terminal_errors_escape_the_loop() {
        assert!(Error::TransportCancelled.is_terminal());
        assert!(Error::StopRequested.is_terminal());
        assert!(!Error::Protocol(ResponseCode::GeneralError).is_terminal());
        assert!(!Error::EndOfTransmission.is_terminal());
    }
}
