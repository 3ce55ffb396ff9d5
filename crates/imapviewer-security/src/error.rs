use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("oauth error: {0}")]
    OAuth(String),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Failure of a refresh-token exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("refresh token expired or revoked: {0}")]
    InvalidGrant(String),
    #[error("client rejected by token endpoint: {0}")]
    InvalidClient(String),
    #[error("client not authorized for refresh grant: {0}")]
    UnauthorizedClient(String),
    #[error("token request timed out: {0}")]
    Timeout(String),
    #[error("token endpoint host not found: {0}")]
    HostNotFound(String),
    #[error("token endpoint refused the connection: {0}")]
    ConnectionRefused(String),
    #[error("proxy error during token request: {0}")]
    Proxy(String),
    #[error("token response carries no access_token")]
    MissingAccessToken,
    #[error("token request failed: {0}")]
    Other(String),
}

impl TokenError {
    /// The refresh token can no longer be used; the user has to sign in again.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::InvalidGrant(_))
    }
}
