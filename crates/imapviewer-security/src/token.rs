use crate::TokenError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use imapviewer_core::{ProxyKind, ProxyUrl, TokenState};
use serde::Deserialize;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;
const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Refresh-token grant. Deliberately carries no scope parameter.
#[derive(Clone)]
pub struct RefreshRequest {
    client_id: String,
    refresh_token: String,
}

impl RefreshRequest {
    pub fn new(client_id: &str, refresh_token: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            refresh_token: refresh_token.to_string(),
        }
    }

    pub fn form_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("client_id", self.client_id.clone()),
            ("refresh_token", self.refresh_token.clone()),
            ("grant_type", "refresh_token".to_string()),
        ]
    }
}

impl std::fmt::Debug for RefreshRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshRequest")
            .field("client_id", &self.client_id)
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHttpResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP transport for the token endpoint.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn post_form(
        &self,
        params: &[(&'static str, String)],
        proxy: Option<&ProxyUrl>,
    ) -> Result<TokenHttpResponse, TokenError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTokenEndpoint {
    token_url: Url,
    timeout: Duration,
}

impl ReqwestTokenEndpoint {
    pub fn new(token_url: Url, timeout: Duration) -> Self {
        Self { token_url, timeout }
    }

    fn client(&self, proxy: Option<&ProxyUrl>) -> Result<reqwest::Client, TokenError> {
        let mut builder = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.timeout);

        builder = match proxy {
            Some(proxy) if proxy.kind() == ProxyKind::Socks4 => {
                return Err(TokenError::Proxy(
                    "socks4 proxies cannot carry HTTPS token requests".to_string(),
                ));
            }
            Some(proxy) => {
                let proxy = reqwest::Proxy::all(proxy.as_str())
                    .map_err(|err| TokenError::Proxy(err.to_string()))?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        builder
            .build()
            .map_err(|err| TokenError::Other(err.to_string()))
    }
}

#[async_trait]
impl TokenEndpoint for ReqwestTokenEndpoint {
    async fn post_form(
        &self,
        params: &[(&'static str, String)],
        proxy: Option<&ProxyUrl>,
    ) -> Result<TokenHttpResponse, TokenError> {
        let proxied = proxy.is_some();
        let client = self.client(proxy)?;
        let response = client
            .post(self.token_url.clone())
            .form(params)
            .send()
            .await
            .map_err(|err| classify_transport(&err, proxied))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| classify_transport(&err, proxied))?;

        Ok(TokenHttpResponse { status, body })
    }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}

fn classify_transport(err: &reqwest::Error, proxied: bool) -> TokenError {
    let detail = error_chain(err);
    let lower = detail.to_ascii_lowercase();

    if err.is_timeout() || lower.contains("timed out") {
        TokenError::Timeout(detail)
    } else if proxied && (lower.contains("proxy") || lower.contains("socks")) {
        TokenError::Proxy(detail)
    } else if lower.contains("dns error")
        || lower.contains("failed to lookup")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
    {
        TokenError::HostNotFound(detail)
    } else if lower.contains("connection refused") {
        TokenError::ConnectionRefused(detail)
    } else {
        TokenError::Other(detail)
    }
}

#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<serde_json::Value>,
    scope: Option<String>,
    token_type: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    #[serde(default)]
    error_codes: Vec<i64>,
}

fn expires_in_secs(value: Option<&serde_json::Value>) -> i64 {
    match value {
        Some(serde_json::Value::Number(number)) => number.as_i64(),
        Some(serde_json::Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    }
    .filter(|secs| *secs > 0)
    .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
}

fn classify_oauth_error(code: &str, description: Option<&str>, codes: &[i64]) -> TokenError {
    let mut detail = description.unwrap_or(code).to_string();
    if !codes.is_empty() {
        detail.push_str(&format!(" (error codes {codes:?})"));
    }

    match code {
        "invalid_grant" => TokenError::InvalidGrant(detail),
        "invalid_client" => TokenError::InvalidClient(detail),
        "unauthorized_client" => TokenError::UnauthorizedClient(detail),
        other => TokenError::Other(format!("{other}: {detail}")),
    }
}

/// Turns a raw token-endpoint reply into a [`TokenState`] or a classified error.
pub fn parse_token_response(
    response: &TokenHttpResponse,
    now: DateTime<Utc>,
) -> Result<TokenState, TokenError> {
    let raw = serde_json::from_str::<RawTokenResponse>(&response.body).ok();

    if let Some(raw) = raw.as_ref() {
        if let Some(code) = raw.error.as_deref() {
            return Err(classify_oauth_error(
                code,
                raw.error_description.as_deref(),
                &raw.error_codes,
            ));
        }
    }

    if !(200..300).contains(&response.status) {
        return Err(TokenError::Other(format!(
            "token endpoint returned HTTP {}",
            response.status
        )));
    }

    let raw = raw.ok_or_else(|| TokenError::Other("token response is not valid JSON".to_string()))?;
    let access_token = raw
        .access_token
        .filter(|token| !token.is_empty())
        .ok_or(TokenError::MissingAccessToken)?;

    Ok(TokenState {
        access_token,
        refresh_token: raw.refresh_token.filter(|token| !token.is_empty()),
        expires_at: now + ChronoDuration::seconds(expires_in_secs(raw.expires_in.as_ref())),
        scope: raw.scope.unwrap_or_default(),
        token_type: raw
            .token_type
            .filter(|kind| !kind.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
    })
}

/// Exchanges refresh tokens for access tokens, preferring the proxy when one is set.
#[derive(Clone)]
pub struct TokenProvider {
    endpoint: Arc<dyn TokenEndpoint>,
}

impl TokenProvider {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self { endpoint }
    }

    pub async fn get_access_token(
        &self,
        client_id: &str,
        refresh_token: &str,
        proxy: Option<&ProxyUrl>,
    ) -> Result<TokenState, TokenError> {
        let request = RefreshRequest::new(client_id, refresh_token);

        if let Some(proxy) = proxy {
            match self.exchange(&request, Some(proxy)).await {
                Ok(token) => return Ok(token),
                Err(err) => {
                    tracing::warn!(
                        proxy = %proxy.redacted(),
                        error = %err,
                        "token refresh through proxy failed, retrying directly"
                    );
                }
            }
        }

        self.exchange(&request, None).await
    }

    async fn exchange(
        &self,
        request: &RefreshRequest,
        proxy: Option<&ProxyUrl>,
    ) -> Result<TokenState, TokenError> {
        let response = self.endpoint.post_form(&request.form_params(), proxy).await?;
        let token = parse_token_response(&response, Utc::now())?;
        tracing::debug!(
            via_proxy = proxy.is_some(),
            expires_at = %token.expires_at,
            "refreshed access token"
        );
        Ok(token)
    }
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider").finish_non_exhaustive()
    }
}
