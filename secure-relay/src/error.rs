use std::io;

use thiserror::Error;

/// Failures raised by the relay library.
///
/// The variants follow how a connection reacts to them: `Handshake` and
/// `Transport` end the connection, while `Integrity` and `Format` only
/// discard the offending line once a session is established.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("malformed text encoding: {0}")]
    Format(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("key error: {0}")]
    Key(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// Re-labels any failure seen while establishing a session as a handshake failure.
    pub fn during_handshake(self) -> Self {
        match self {
            RelayError::Handshake(_) => self,
            other => RelayError::Handshake(other.to_string()),
        }
    }

    /// Whether the error only spoils a single data line and the session can go on.
    pub fn is_line_local(&self) -> bool {
        matches!(self, RelayError::Integrity(_) | RelayError::Format(_))
    }

    pub(crate) fn closed(what: &str) -> Self {
        RelayError::Transport(io::Error::new(io::ErrorKind::BrokenPipe, what.to_string()))
    }

    pub(crate) fn lagging(what: &str) -> Self {
        RelayError::Transport(io::Error::new(io::ErrorKind::WouldBlock, what.to_string()))
    }
}

impl From<base64::DecodeError> for RelayError {
    fn from(err: base64::DecodeError) -> Self {
        RelayError::Format(format!("base64 decode error: {err}"))
    }
}

impl From<std::string::FromUtf8Error> for RelayError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        RelayError::Format(format!("UTF-8 decode error: {err}"))
    }
}
