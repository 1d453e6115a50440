// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{error, ffi::NulError, fmt, io, num::TryFromIntError, str};

/// Error type for VideoStream operations.
///
/// Variants map directly to the error taxonomy every operation in this
/// crate is specified against: callers can match on `kind`-equivalent
/// variants without needing to inspect the wrapped `io::Error` for most
/// recovery decisions.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// Caller violated an input contract (null/absent handle, bad geometry,
    /// a frame that already has a buffer attached, etc).
    InvalidArgument(String),

    /// The kernel refused a buffer allocation or socket operation.
    ResourceUnavailable(io::Error),

    /// A named shared-memory region with that name already exists.
    NameExists,

    /// No access to a DMA-heap device node or socket path.
    PermissionDenied(io::Error),

    /// The socket path is already bound by a live host.
    AddressInUse,

    /// No host is listening at the given path.
    ConnectionRefused,

    /// The peer closed the connection, or a malformed message was treated
    /// as equivalent to a hangup.
    Disconnected,

    /// A deadline elapsed before the operation completed.
    Timeout,

    /// The client has reached its configured per-connection hold cap.
    LimitExceeded,

    /// The frame has no mapping (and the operation required one).
    Unmapped,

    /// The operation requires a capability this buffer/platform doesn't have
    /// (e.g. a physical address for a shared-memory-backed frame).
    NotSupported,

    /// I/O error not covered by a more specific variant above.
    Io(io::Error),

    /// UTF-8 conversion error.
    Utf8(str::Utf8Error),

    /// `CString` construction error (embedded NUL byte).
    CString(NulError),

    /// Integer conversion error.
    TryFromInt(TryFromIntError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::ResourceUnavailable(err) => write!(f, "resource unavailable: {err}"),
            Error::NameExists => write!(f, "shared-memory name already exists"),
            Error::PermissionDenied(err) => write!(f, "permission denied: {err}"),
            Error::AddressInUse => write!(f, "socket path held by a live host"),
            Error::ConnectionRefused => write!(f, "no host listening at this path"),
            Error::Disconnected => write!(f, "peer closed the connection"),
            Error::Timeout => write!(f, "deadline elapsed"),
            Error::LimitExceeded => write!(f, "per-client hold cap exceeded"),
            Error::Unmapped => write!(f, "frame has no active mapping"),
            Error::NotSupported => write!(f, "operation not supported for this buffer"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Utf8(err) => write!(f, "UTF-8 conversion error: {err}"),
            Error::CString(err) => write!(f, "CString creation error: {err}"),
            Error::TryFromInt(err) => write!(f, "integer conversion error: {err}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::ResourceUnavailable(err) | Error::PermissionDenied(err) | Error::Io(err) => {
                Some(err)
            }
            Error::Utf8(err) => Some(err),
            Error::CString(err) => Some(err),
            Error::TryFromInt(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::AddrInUse => Error::AddressInUse,
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(err),
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => Error::Disconnected,
            _ => Error::Io(err),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::from(io::Error::from(err))
    }
}

impl From<str::Utf8Error> for Error {
    fn from(err: str::Utf8Error) -> Self {
        Error::Utf8(err)
    }
}

impl From<NulError> for Error {
    fn from(err: NulError) -> Self {
        Error::CString(err)
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Error::TryFromInt(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_kinds_map_to_taxonomy() {
        let err: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(matches!(err, Error::ConnectionRefused));

        let err: Error = io::Error::from(io::ErrorKind::AddrInUse).into();
        assert!(matches!(err, Error::AddressInUse));

        let err: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, Error::Disconnected));
    }

    #[test]
    fn display_mentions_kind() {
        assert!(format!("{}", Error::LimitExceeded).contains("hold cap"));
        assert!(format!("{}", Error::NotSupported).contains("not supported"));
    }
}
