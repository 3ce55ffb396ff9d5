use imapviewer_core::{Account, ProxyConfig};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub version: u32,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub connection_timeout_secs: u64,
    pub greeting_timeout_secs: u64,
    /// Applied to both timeouts when the connection goes through a proxy.
    pub proxy_timeout_multiplier: u32,
    /// IDLE is re-issued after this long without server activity.
    pub idle_timeout_secs: u64,
    pub logout_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 8,
            greeting_timeout_secs: 5,
            proxy_timeout_multiplier: 3,
            idle_timeout_secs: 25 * 60,
            logout_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub auth_url: Url,
    pub token_url: Url,
    pub redirect_url: Url,
    pub scopes: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            auth_url: Url::parse("https://login.microsoftonline.com/common/oauth2/v2.0/authorize")
                .expect("static auth url"),
            token_url: Url::parse("https://login.microsoftonline.com/common/oauth2/v2.0/token")
                .expect("static token url"),
            redirect_url: Url::parse("http://localhost:53682/callback")
                .expect("static redirect url"),
            scopes: vec![
                "https://outlook.office.com/IMAP.AccessAsUser.All".to_string(),
                "offline_access".to_string(),
            ],
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Newest inbox messages returned by account initialization.
    pub initial_email_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_email_limit: 50,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            proxy: ProxyConfig::default(),
            connection: ConnectionConfig::default(),
            oauth: OAuthConfig::default(),
            sync: SyncConfig::default(),
            accounts: Vec::new(),
        }
    }
}
