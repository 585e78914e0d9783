//! Error types surfaced by the environment adapter.
//!
//! Derivation itself is designed to be infallible; the only hard failures
//! are a malformed `Content-Length` header and the acquisition of
//! per-request ancillary resources by the server layer.

use std::{error::Error as StdError, fmt, io};

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Error returned by [`EnvironmentBuilder::build`].
///
/// [`EnvironmentBuilder::build`]: crate::EnvironmentBuilder::build
#[derive(Debug)]
#[non_exhaustive]
pub enum BuildError {
    /// The `Content-Length` header was present but did not parse
    /// as a non-negative integer.
    ///
    /// This is a hard failure: the field is neither defaulted nor dropped,
    /// the server layer is expected to reject the request without ever
    /// invoking application code.
    InvalidContentLength(String),
    /// Acquiring an ancillary per-request resource
    /// (request input, error sink) failed.
    Io(io::Error),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidContentLength(raw) => {
                write!(f, "invalid Content-Length header value: {raw:?}")
            }
            Self::Io(err) => write!(f, "request resource acquisition failed: {err}"),
        }
    }
}

impl StdError for BuildError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::InvalidContentLength(_) => None,
            Self::Io(err) => Some(err),
        }
    }
}

impl From<io::Error> for BuildError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Error returned when the connection hijack handshake
/// is attempted more than once for the same request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyHijacked;

impl fmt::Display for AlreadyHijacked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection was already hijacked for this request")
    }
}

impl StdError for AlreadyHijacked {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_error_display() {
        let err = BuildError::InvalidContentLength("abc".to_owned());
        assert!(err.to_string().contains("abc"));

        let err = BuildError::from(io::Error::other("input unavailable"));
        assert!(err.to_string().contains("input unavailable"));
    }
}
