use imapviewer_core::{AccountId, SourceError};
use imapviewer_security::TokenError;
use thiserror::Error;

/// Failure to establish or use an account's session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("refresh token expired or revoked, sign in again")]
    TokenExpired,
    #[error("oauth client rejected: {0}")]
    InvalidClient(String),
    #[error("connection timed out: {0}")]
    Timeout(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("host not found: {0}")]
    HostNotFound(String),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("mailbox not found: {0}")]
    MailboxNotFound(String),
    #[error("connection error: {0}")]
    Generic(String),
}

impl From<TokenError> for ConnectionError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidGrant(_) => Self::TokenExpired,
            TokenError::InvalidClient(detail) | TokenError::UnauthorizedClient(detail) => {
                Self::InvalidClient(detail)
            }
            TokenError::Timeout(detail) => Self::Timeout(detail),
            TokenError::HostNotFound(detail) => Self::HostNotFound(detail),
            TokenError::ConnectionRefused(detail) => Self::ConnectionRefused(detail),
            TokenError::Proxy(detail) => Self::Proxy(detail),
            TokenError::MissingAccessToken => Self::AuthenticationFailed(err.to_string()),
            TokenError::Other(detail) => Self::Generic(detail),
        }
    }
}

impl From<SourceError> for ConnectionError {
    fn from(err: SourceError) -> Self {
        Self::Generic(err.to_string())
    }
}

impl From<async_imap::error::Error> for ConnectionError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error;
        match err {
            Error::Io(io) => io_error(io),
            Error::ConnectionLost => Self::Generic("connection lost".to_string()),
            Error::No(detail) | Error::Bad(detail) => Self::Generic(detail),
            other => Self::Generic(other.to_string()),
        }
    }
}

pub(crate) fn io_error(err: std::io::Error) -> ConnectionError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut => ConnectionError::Timeout(err.to_string()),
        ErrorKind::ConnectionRefused => ConnectionError::ConnectionRefused(err.to_string()),
        _ => ConnectionError::Generic(err.to_string()),
    }
}
