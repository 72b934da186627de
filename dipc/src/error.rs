//! Error types and the failure-report callback.
//!
//! The transport never logs and never panics on failure. Every fallible
//! operation returns [`Result`], and operations that manage OS resources
//! additionally accept an optional [`ErrorCallback`] so the embedding
//! runtime can record failures in whatever way suits it.

use std::fmt;
use std::io;

/// Callback invoked when a transport operation fails.
///
/// The first argument is a human-readable description, the second the raw
/// OS error code when one exists (zero otherwise). Passing `None` wherever
/// a callback is accepted makes failures silent but still best-effort safe.
pub type ErrorCallback = fn(message: &str, code: i32);

/// Errors produced by the transport.
#[derive(Debug)]
pub enum Error {
    /// The operation is not valid for this endpoint's role.
    WrongRole(&'static str),

    /// The endpoint is not in a state where the operation makes sense.
    InvalidState(&'static str),

    /// A bounded wait elapsed before the operation completed.
    TimedOut,

    /// The peer closed its end of the stream.
    Disconnected,

    /// The magic bytes of a message did not match.
    InvalidMagic,

    /// A message header or payload was malformed.
    BadEncoding(&'static str),

    /// One or more listener slots failed to arm; the indexes say which.
    SlotSetup(Vec<usize>),

    /// The underlying OS operation failed.
    Io(io::Error),
}

impl Error {
    /// Raw OS error code for the callback contract.
    ///
    /// Zero when the failure did not come from the OS.
    pub fn os_code(&self) -> i32 {
        match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }

    /// Returns true when the failure is a bounded-wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WrongRole(op) => write!(f, "operation not valid for this role: {op}"),
            Error::InvalidState(what) => write!(f, "invalid state: {what}"),
            Error::TimedOut => write!(f, "operation timed out"),
            Error::Disconnected => write!(f, "peer disconnected"),
            Error::InvalidMagic => write!(f, "invalid magic bytes"),
            Error::BadEncoding(what) => write!(f, "bad message encoding: {what}"),
            Error::SlotSetup(slots) => write!(f, "listener slots failed to arm: {slots:?}"),
            Error::Io(err) => write!(f, "os error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(err as i32))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Formats an error with its context and forwards it to the callback.
pub(crate) fn report_error(callback: Option<ErrorCallback>, context: &str, err: &Error) {
    if let Some(cb) = callback {
        cb(&format!("{context}: {err}"), err.os_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_os_code_from_io() {
        let err = Error::Io(io::Error::from_raw_os_error(9));
        assert_eq!(err.os_code(), 9);
    }

    #[test]
    fn test_error_os_code_zero_for_logical_failures() {
        assert_eq!(Error::TimedOut.os_code(), 0);
        assert_eq!(Error::WrongRole("connect").os_code(), 0);
        assert_eq!(Error::InvalidMagic.os_code(), 0);
    }

    #[test]
    fn test_error_display_names_slots() {
        let err = Error::SlotSetup(vec![0, 2]);
        let text = err.to_string();
        assert!(text.contains('0'));
        assert!(text.contains('2'));
    }
}
