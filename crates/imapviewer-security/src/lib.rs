mod error;
mod oauth;
mod token;

pub use error::{SecurityError, TokenError};
pub use oauth::{OAuthProfile, OAuthTokenResult, ReauthSession, ReauthWorkflow};
pub use token::{
    parse_token_response, RefreshRequest, ReqwestTokenEndpoint, TokenEndpoint, TokenHttpResponse,
    TokenProvider,
};
