use crate::SecurityError;
use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProfile {
    pub client_id: String,
    pub auth_url: Url,
    pub token_url: Url,
    pub redirect_url: Url,
    pub scopes: Vec<String>,
}

/// Pending sign-in started for an account whose refresh token was revoked.
#[derive(Clone, Serialize, Deserialize)]
pub struct ReauthSession {
    pub authorization_url: String,
    pub csrf_state: String,
    pub pkce_verifier: String,
}

impl ReauthSession {
    pub fn matches_state(&self, returned_state: &str) -> bool {
        !returned_state.is_empty() && self.csrf_state == returned_state
    }
}

impl std::fmt::Debug for ReauthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReauthSession")
            .field("authorization_url", &self.authorization_url)
            .field("csrf_state", &"[REDACTED]")
            .field("pkce_verifier", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthTokenResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in_secs: Option<u64>,
}

impl std::fmt::Debug for OAuthTokenResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokenResult")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in_secs", &self.expires_in_secs)
            .finish()
    }
}

/// Interactive PKCE authorization-code flow used after a token expiry.
#[derive(Debug, Clone)]
pub struct ReauthWorkflow {
    profile: OAuthProfile,
}

impl ReauthWorkflow {
    pub fn new(profile: OAuthProfile) -> Result<Self, SecurityError> {
        Self::validate_profile(&profile)?;
        Ok(Self { profile })
    }

    fn validate_profile(profile: &OAuthProfile) -> Result<(), SecurityError> {
        for (label, url) in [("Authorization", &profile.auth_url), ("Token", &profile.token_url)] {
            if url.scheme() != "https" {
                return Err(SecurityError::OAuth(format!("{label} URL must use HTTPS")));
            }
            if url.host_str().is_none() {
                return Err(SecurityError::OAuth(format!(
                    "{label} URL must have a valid host"
                )));
            }
        }

        let redirect_host = profile.redirect_url.host_str().unwrap_or("");
        let is_loopback = matches!(redirect_host, "127.0.0.1" | "localhost" | "[::1]");
        if !is_loopback {
            return Err(SecurityError::OAuth(
                "Redirect URL must point to a loopback address".to_string(),
            ));
        }

        let client_id = profile.client_id.trim();
        if client_id.is_empty() {
            return Err(SecurityError::OAuth("Client ID is required".to_string()));
        }
        if client_id.len() > 512 {
            return Err(SecurityError::OAuth(
                "Client ID appears invalid (too long)".to_string(),
            ));
        }

        Ok(())
    }

    fn client(
        &self,
    ) -> Result<
        BasicClient<
            oauth2::EndpointSet,
            oauth2::EndpointNotSet,
            oauth2::EndpointNotSet,
            oauth2::EndpointNotSet,
            oauth2::EndpointSet,
        >,
        SecurityError,
    > {
        Ok(BasicClient::new(ClientId::new(self.profile.client_id.clone()))
            .set_auth_uri(AuthUrl::new(self.profile.auth_url.as_str().to_string())?)
            .set_token_uri(TokenUrl::new(self.profile.token_url.as_str().to_string())?)
            .set_redirect_uri(RedirectUrl::new(
                self.profile.redirect_url.as_str().to_string(),
            )?))
    }

    /// Builds the authorization URL, pre-filling the sign-in form with `login_hint`.
    pub fn begin(&self, login_hint: &str) -> Result<ReauthSession, SecurityError> {
        let client = self.client()?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let mut auth_request = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge);

        for scope in &self.profile.scopes {
            auth_request = auth_request.add_scope(Scope::new(scope.to_string()));
        }
        if !login_hint.is_empty() {
            auth_request = auth_request.add_extra_param("login_hint", login_hint.to_string());
        }

        let (auth_url, csrf_state) = auth_request.url();

        Ok(ReauthSession {
            authorization_url: auth_url.to_string(),
            csrf_state: csrf_state.secret().to_string(),
            pkce_verifier: pkce_verifier.secret().to_string(),
        })
    }

    pub async fn complete(
        &self,
        session: &ReauthSession,
        returned_state: &str,
        code: &str,
    ) -> Result<OAuthTokenResult, SecurityError> {
        if !session.matches_state(returned_state) {
            return Err(SecurityError::OAuth(
                "authorization response state does not match".to_string(),
            ));
        }

        let client = self.client()?;
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let token = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(session.pkce_verifier.clone()))
            .request_async(&http_client)
            .await
            .map_err(|err| SecurityError::OAuth(err.to_string()))?;

        if token.refresh_token().is_none() {
            tracing::warn!("re-authentication returned no refresh token");
        }

        Ok(OAuthTokenResult {
            access_token: token.access_token().secret().to_string(),
            refresh_token: token
                .refresh_token()
                .map(|token| token.secret().to_string()),
            expires_in_secs: token.expires_in().map(|duration| duration.as_secs()),
        })
    }
}
