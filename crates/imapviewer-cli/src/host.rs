use anyhow::Context;
use chrono::{DateTime, Utc};
use imapviewer_config::{AppConfig, ConfigManager};
use imapviewer_core::{AccountId, AuthConfig, CachedToken, ConnectionStatus, LogLevel, TokenState};
use imapviewer_email::{
    ConnectTimeouts, ConnectionManager, ImapConnector, ManagerSettings, Notifier, TracingNotifier,
};
use imapviewer_security::{ReqwestTokenEndpoint, TokenProvider};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub struct Host {
    pub config_manager: ConfigManager,
    pub config: AppConfig,
    pub manager: ConnectionManager,
}

impl Host {
    pub fn initialize(config_manager: ConfigManager) -> anyhow::Result<Self> {
        let config = config_manager.load().context("load app config")?;

        let connector = ImapConnector::new(Duration::from_secs(config.connection.idle_timeout_secs))
            .context("initialize IMAP connector")?;
        let endpoint = ReqwestTokenEndpoint::new(
            config.oauth.token_url.clone(),
            Duration::from_secs(config.oauth.request_timeout_secs),
        );
        let notifier = PersistingNotifier::new(config_manager.clone());

        let sources = Arc::new(config_manager.clone());
        let manager = ConnectionManager::new(
            sources.clone(),
            sources,
            TokenProvider::new(Arc::new(endpoint)),
            Arc::new(connector),
            Arc::new(notifier),
            settings(&config),
        );

        Ok(Self {
            config_manager,
            config,
            manager,
        })
    }
}

fn settings(config: &AppConfig) -> ManagerSettings {
    ManagerSettings {
        timeouts: ConnectTimeouts {
            connection: Duration::from_secs(config.connection.connection_timeout_secs),
            greeting: Duration::from_secs(config.connection.greeting_timeout_secs),
        },
        proxy_timeout_multiplier: config.connection.proxy_timeout_multiplier,
        logout_timeout: Duration::from_secs(config.connection.logout_timeout_secs),
        ..ManagerSettings::default()
    }
}

/// Logs every event and writes refreshed access tokens back to the config file.
struct PersistingNotifier {
    config_manager: ConfigManager,
    inner: TracingNotifier,
    // serializes load-modify-save of the config file
    write_lock: Arc<Mutex<()>>,
}

impl PersistingNotifier {
    fn new(config_manager: ConfigManager) -> Self {
        Self {
            config_manager,
            inner: TracingNotifier,
            write_lock: Arc::new(Mutex::new(())),
        }
    }
}

impl Notifier for PersistingNotifier {
    fn on_status_change(&self, account_id: &AccountId, status: ConnectionStatus, detail: Option<&str>) {
        self.inner.on_status_change(account_id, status, detail);
    }

    fn on_log(&self, account_id: &AccountId, level: LogLevel, message: &str) {
        self.inner.on_log(account_id, level, message);
    }

    fn on_token_expired(&self, account_id: &AccountId) {
        self.inner.on_token_expired(account_id);
        eprintln!("Sign-in for {account_id} expired. Run `imapviewer reauth {account_id}`.");
    }

    fn on_new_mail(&self, account_id: &AccountId, mailbox_path: &str, delta: u32) {
        self.inner.on_new_mail(account_id, mailbox_path, delta);
        println!("{account_id}: {delta} new message(s) in {mailbox_path}");
    }

    fn on_token_refreshed(&self, account_id: &AccountId, token: &TokenState) {
        self.inner.on_token_refreshed(account_id, token);

        // file I/O stays off the connect task
        let config_manager = self.config_manager.clone();
        let write_lock = self.write_lock.clone();
        let account_id = account_id.clone();
        let token = token.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = store_token(
                &config_manager,
                &account_id,
                &token.access_token,
                token.refresh_token.as_deref(),
                token.expires_at,
            ) {
                tracing::warn!(account_id = %account_id, error = %err, "failed to cache access token");
            }
        });
    }
}

/// Updates the account's cached access token, and its refresh token when rotated.
pub fn store_token(
    config_manager: &ConfigManager,
    account_id: &AccountId,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    let mut config = config_manager.load().context("load app config")?;
    let account = config
        .accounts
        .iter_mut()
        .find(|account| &account.id == account_id)
        .with_context(|| format!("account {account_id} not configured"))?;

    match &mut account.auth {
        AuthConfig::OAuth2 {
            refresh_token: stored,
            cached,
            ..
        } => {
            if let Some(rotated) = refresh_token {
                *stored = rotated.to_string();
            }
            *cached = Some(CachedToken {
                access_token: access_token.to_string(),
                expires_at,
            });
        }
        AuthConfig::Password { .. } => anyhow::bail!("account {account_id} does not use OAuth2"),
    }

    config_manager.save(&config).context("save app config")
}
