use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::protocol::SessionId;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Malformed HTTP message: {0}")]
    Malformed(String),

    #[error("Incomplete HTTP message")]
    Incomplete,

    #[error("Server responded with {0}")]
    Status(StatusCode),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session {0} is already registered")]
    DuplicateSession(SessionId),
}

impl TunnelError {
    /// True for failures talking to a peer (target, server or forward proxy),
    /// as opposed to a message we could not make sense of.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TunnelError::Io(_)
                | TunnelError::Dial { .. }
                | TunnelError::Http(_)
                | TunnelError::Status(_)
                | TunnelError::Timeout(_)
        )
    }
}

impl From<httparse::Error> for TunnelError {
    fn from(e: httparse::Error) -> Self {
        TunnelError::Malformed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let dial = TunnelError::Dial {
            addr: "example.com:443".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(dial.is_transport());
        assert!(TunnelError::Timeout(Duration::from_secs(1)).is_transport());
        assert!(!TunnelError::Malformed("bad".to_string()).is_transport());
        assert!(!TunnelError::Incomplete.is_transport());
    }

    #[test]
    fn test_httparse_error_is_malformed() {
        let err: TunnelError = httparse::Error::Token.into();
        assert!(matches!(err, TunnelError::Malformed(_)));
    }
}
