use crate::initializer::SharedInit;
use crate::notifier::Notifier;
use crate::proxy::ProxyResolver;
use crate::registry::ConnectionRegistry;
use crate::session::{ConnectRequest, ConnectTimeouts, Credentials, MailConnector, SessionHandle};
use crate::watcher::WatcherSlot;
use crate::ConnectionError;
use futures::future::{BoxFuture, FutureExt, Shared};
use imapviewer_core::{Account, AccountId, AccountSource, AuthConfig, ConnectionStatus, ProxySource, ProxyUrl};
use imapviewer_security::TokenProvider;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

type SharedConnect = Shared<BoxFuture<'static, Result<SessionHandle, ConnectionError>>>;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub timeouts: ConnectTimeouts,
    pub proxy_timeout_multiplier: u32,
    pub logout_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            timeouts: ConnectTimeouts::default(),
            proxy_timeout_multiplier: 3,
            logout_timeout: Duration::from_secs(5),
        }
    }
}

struct PendingAttempt {
    id: u64,
    future: SharedConnect,
}

enum AttemptOutcome {
    Registered {
        session: SessionHandle,
        displaced: Option<SessionHandle>,
    },
    Superseded(SessionHandle),
    Failed(ConnectionError),
}

pub(crate) struct Inner {
    accounts: Arc<dyn AccountSource>,
    proxies: ProxyResolver,
    tokens: TokenProvider,
    connector: Arc<dyn MailConnector>,
    pub(crate) notifier: Arc<dyn Notifier>,
    settings: ManagerSettings,
    pub(crate) registry: ConnectionRegistry,
    attempts: Mutex<HashMap<AccountId, PendingAttempt>>,
    pub(crate) watchers: Mutex<HashMap<AccountId, WatcherSlot>>,
    pub(crate) init_locks: Mutex<HashMap<AccountId, SharedInit>>,
    next_id: AtomicU64,
}

/// Owns every live session and in-flight operation for all accounts.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        accounts: Arc<dyn AccountSource>,
        proxies: Arc<dyn ProxySource>,
        tokens: TokenProvider,
        connector: Arc<dyn MailConnector>,
        notifier: Arc<dyn Notifier>,
        settings: ManagerSettings,
    ) -> Self {
        let registry = ConnectionRegistry::new(settings.logout_timeout);
        Self {
            inner: Arc::new(Inner {
                accounts,
                proxies: ProxyResolver::new(proxies),
                tokens,
                connector,
                notifier,
                settings,
                registry,
                attempts: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
                init_locks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the account's live session, joining or starting a connection attempt.
    pub async fn connect(&self, account_id: &AccountId) -> Result<SessionHandle, ConnectionError> {
        let (attempt, stale) = {
            let mut attempts = self.inner.attempts.lock().await;
            let stale = match self.inner.registry.lookup(account_id).await {
                Ok(session) => return Ok(session),
                Err(stale) => stale,
            };

            let attempt = match attempts.get(account_id) {
                Some(pending) => {
                    tracing::debug!(account_id = %account_id, "joining in-flight connection attempt");
                    pending.future.clone()
                }
                None => {
                    let pending = self.spawn_attempt(account_id);
                    let future = pending.future.clone();
                    attempts.insert(account_id.clone(), pending);
                    future
                }
            };
            (attempt, stale)
        };

        if let Some(stale) = stale {
            self.inner.registry.retire(account_id, stale).await;
        }
        attempt.await
    }

    fn spawn_attempt(&self, account_id: &AccountId) -> PendingAttempt {
        let id = self.next_id();
        let manager = self.clone();
        let task_account = account_id.clone();

        let task = tokio::spawn(async move {
            manager
                .inner
                .notifier
                .on_status_change(&task_account, ConnectionStatus::Connecting, None);
            let result = AssertUnwindSafe(manager.establish(&task_account))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(ConnectionError::Generic(
                        "connection attempt panicked".to_string(),
                    ))
                });
            manager.finish_attempt(&task_account, id, result).await
        });

        let future = async move {
            task.await.unwrap_or_else(|err| {
                Err(ConnectionError::Generic(format!(
                    "connection task failed: {err}"
                )))
            })
        }
        .boxed()
        .shared();

        PendingAttempt { id, future }
    }

    async fn establish(&self, account_id: &AccountId) -> Result<SessionHandle, ConnectionError> {
        let account = self
            .inner
            .accounts
            .account(account_id)
            .await?
            .ok_or_else(|| ConnectionError::AccountNotFound(account_id.clone()))?;

        let proxy = self.inner.proxies.resolve().await;
        let credentials = self.credentials(&account, proxy.as_ref()).await?;
        let timeouts = if proxy.is_some() {
            self.inner
                .settings
                .timeouts
                .scaled(self.inner.settings.proxy_timeout_multiplier)
        } else {
            self.inner.settings.timeouts
        };

        tracing::info!(
            account_id = %account_id,
            host = %account.incoming.host,
            port = account.incoming.port,
            proxy = ?proxy.as_ref().map(ProxyUrl::redacted),
            "connecting"
        );

        self.inner
            .connector
            .connect(ConnectRequest {
                account_id: account_id.clone(),
                host: account.incoming.host.clone(),
                port: account.incoming.port,
                secure: account.incoming.secure,
                credentials,
                proxy,
                timeouts,
            })
            .await
    }

    async fn credentials(
        &self,
        account: &Account,
        proxy: Option<&ProxyUrl>,
    ) -> Result<Credentials, ConnectionError> {
        match &account.auth {
            AuthConfig::Password { password } => Ok(Credentials::Password {
                username: account.login_name().to_string(),
                password: password.clone(),
            }),
            // every connect exchanges the refresh token; a cached access token is never reused
            AuthConfig::OAuth2 {
                client_id,
                refresh_token,
                ..
            } => {
                match self
                    .inner
                    .tokens
                    .get_access_token(client_id, refresh_token, proxy)
                    .await
                {
                    Ok(token) => {
                        self.inner.notifier.on_token_refreshed(&account.id, &token);
                        Ok(Credentials::XOAuth2 {
                            user: account.email.clone(),
                            access_token: token.access_token,
                        })
                    }
                    Err(err) => {
                        if err.is_expired() {
                            tracing::warn!(account_id = %account.id, "refresh token rejected as expired");
                            self.inner.notifier.on_token_expired(&account.id);
                        }
                        Err(err.into())
                    }
                }
            }
        }
    }

    async fn finish_attempt(
        &self,
        account_id: &AccountId,
        id: u64,
        result: Result<SessionHandle, ConnectionError>,
    ) -> Result<SessionHandle, ConnectionError> {
        let outcome = {
            let mut attempts = self.inner.attempts.lock().await;
            let current = matches!(attempts.get(account_id), Some(pending) if pending.id == id);
            if current {
                attempts.remove(account_id);
            }

            match result {
                Ok(session) if current => {
                    let displaced = self.inner.registry.install(account_id, session.clone()).await;
                    AttemptOutcome::Registered { session, displaced }
                }
                Ok(session) => AttemptOutcome::Superseded(session),
                Err(err) => AttemptOutcome::Failed(err),
            }
        };

        match outcome {
            AttemptOutcome::Registered { session, displaced } => {
                if let Some(displaced) = displaced {
                    self.inner.registry.retire(account_id, displaced).await;
                }
                tracing::info!(account_id = %account_id, "connected");
                self.inner
                    .notifier
                    .on_status_change(account_id, ConnectionStatus::Connected, None);
                Ok(session)
            }
            AttemptOutcome::Superseded(session) => {
                tracing::info!(account_id = %account_id, "connection finished after shutdown, logging out");
                self.inner.registry.retire(account_id, session).await;
                let err = ConnectionError::Generic("connection attempt cancelled".to_string());
                self.inner.notifier.on_status_change(
                    account_id,
                    ConnectionStatus::Disconnected,
                    Some(&err.to_string()),
                );
                Err(err)
            }
            AttemptOutcome::Failed(err) => {
                tracing::warn!(account_id = %account_id, error = %err, "connection failed");
                self.inner.notifier.on_status_change(
                    account_id,
                    ConnectionStatus::Disconnected,
                    Some(&err.to_string()),
                );
                Err(err)
            }
        }
    }

    /// Tears down the account's session and watcher.
    pub async fn disconnect(&self, account_id: &AccountId) {
        self.stop(account_id).await;
        self.inner.registry.end(account_id).await;
        self.inner
            .notifier
            .on_status_change(account_id, ConnectionStatus::Disconnected, None);
    }

    /// Shuts everything down. In-flight attempts log out instead of registering.
    pub async fn end_all(&self) {
        self.inner.attempts.lock().await.clear();
        self.stop_all().await;
        self.inner.registry.end_all().await;
    }

    pub async fn is_connected(&self, account_id: &AccountId) -> bool {
        self.inner.registry.get(account_id).await.is_some()
    }

    pub async fn connected_count(&self) -> usize {
        self.inner.registry.len().await
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.attempts.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::fakes::{oauth_account, password_account, Harness};
    use crate::notifier::NotifierEvent;
    use crate::session::same_session;
    use crate::ConnectionError;
    use imapviewer_core::{AccountId, CachedToken, ConnectionStatus, ProxyConfig, ProxyKind};
    use std::time::Duration;

    fn id(value: &str) -> AccountId {
        AccountId::from(value)
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_login() {
        let harness = Harness::new(vec![password_account("a")]);
        harness.connector.set_delay(Duration::from_millis(50));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = harness.manager.clone();
            tasks.push(tokio::spawn(async move { manager.connect(&id("a")).await }));
        }

        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.expect("task joined").expect("connected"));
        }

        assert_eq!(harness.connector.logins(), 1);
        assert!(sessions.windows(2).all(|pair| same_session(&pair[0], &pair[1])));
        assert_eq!(harness.manager.pending_count().await, 0);
        assert_eq!(harness.manager.connected_count().await, 1);
    }

    #[tokio::test]
    async fn registered_session_is_reused_without_io() {
        let harness = Harness::new(vec![password_account("a")]);
        let first = harness.manager.connect(&id("a")).await.expect("connected");
        let second = harness.manager.connect(&id("a")).await.expect("connected");
        assert!(same_session(&first, &second));
        assert_eq!(harness.connector.logins(), 1);
    }

    #[tokio::test]
    async fn unusable_session_triggers_reconnect() {
        let harness = Harness::new(vec![password_account("a")]);
        harness.manager.connect(&id("a")).await.expect("connected");
        harness.connector.session(0).break_connection();

        harness.manager.connect(&id("a")).await.expect("reconnected");
        assert_eq!(harness.connector.logins(), 2);
        assert_eq!(harness.connector.session(0).closes(), 1);
    }

    #[tokio::test]
    async fn unknown_account_fails_with_account_not_found() {
        let mut harness = Harness::new(vec![password_account("a")]);
        let err = harness
            .manager
            .connect(&id("missing"))
            .await
            .err()
            .expect("no such account");
        assert_eq!(err, ConnectionError::AccountNotFound(id("missing")));
        assert_eq!(harness.manager.pending_count().await, 0);

        let events = harness.drain_events();
        assert!(events.contains(&NotifierEvent::Status {
            account_id: id("missing"),
            status: ConnectionStatus::Connecting,
            detail: None,
        }));
        assert!(events.iter().any(|event| matches!(
            event,
            NotifierEvent::Status { status: ConnectionStatus::Disconnected, detail: Some(_), .. }
        )));
    }

    #[tokio::test]
    async fn status_moves_connecting_then_connected() {
        let mut harness = Harness::new(vec![password_account("a")]);
        harness.manager.connect(&id("a")).await.expect("connected");

        let statuses: Vec<_> = harness
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                NotifierEvent::Status { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]);
    }

    #[tokio::test]
    async fn connector_failure_is_returned_and_not_retried() {
        let harness = Harness::new(vec![password_account("a")]);
        harness
            .connector
            .fail_with(ConnectionError::AuthenticationFailed("bad password".to_string()));

        let err = harness.manager.connect(&id("a")).await.err().expect("login fails");
        assert!(matches!(err, ConnectionError::AuthenticationFailed(_)));
        assert_eq!(harness.connector.logins(), 1);
        assert_eq!(harness.manager.connected_count().await, 0);
        assert_eq!(harness.manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn revoked_refresh_token_reports_expiry() {
        let mut harness = Harness::new(vec![oauth_account("o", None)]);
        harness.endpoint.reply(400, r#"{"error":"invalid_grant","error_description":"revoked"}"#);

        let err = harness.manager.connect(&id("o")).await.err().expect("token expired");
        assert_eq!(err, ConnectionError::TokenExpired);
        assert_eq!(harness.connector.logins(), 0);
        assert!(harness
            .drain_events()
            .contains(&NotifierEvent::TokenExpired(id("o"))));
    }

    #[tokio::test]
    async fn oauth_login_uses_refreshed_token() {
        let mut harness = Harness::new(vec![oauth_account("o", None)]);
        harness.endpoint.reply(200, r#"{"access_token":"fresh","expires_in":3600}"#);

        harness.manager.connect(&id("o")).await.expect("connected");
        let request = harness.connector.last_request().expect("connect called");
        match request.credentials {
            crate::session::Credentials::XOAuth2 { user, access_token } => {
                assert_eq!(user, "o@example.com");
                assert_eq!(access_token, "fresh");
            }
            other => panic!("unexpected credentials {other:?}"),
        }
        assert!(harness
            .drain_events()
            .iter()
            .any(|event| matches!(event, NotifierEvent::TokenRefreshed { .. })));
    }

    fn cached_token() -> CachedToken {
        CachedToken {
            access_token: "cached".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(50),
        }
    }

    #[tokio::test]
    async fn cached_token_is_not_used_for_login() {
        let harness = Harness::new(vec![oauth_account("o", Some(cached_token()))]);
        harness.endpoint.reply(200, r#"{"access_token":"fresh"}"#);

        harness.manager.connect(&id("o")).await.expect("connected");
        assert_eq!(harness.endpoint.calls(), 1);
        let request = harness.connector.last_request().expect("connect called");
        assert!(matches!(
            request.credentials,
            crate::session::Credentials::XOAuth2 { ref access_token, .. } if access_token == "fresh"
        ));
    }

    #[tokio::test]
    async fn rejected_login_refreshes_on_the_next_connect() {
        let harness = Harness::new(vec![oauth_account("o", Some(cached_token()))]);
        for _ in 0..3 {
            harness.endpoint.reply(200, r#"{"access_token":"fresh"}"#);
        }
        harness
            .connector
            .fail_with(ConnectionError::AuthenticationFailed("AUTHENTICATE failed".to_string()));

        for _ in 0..3 {
            let err = harness.manager.connect(&id("o")).await.err().expect("login rejected");
            assert!(matches!(err, ConnectionError::AuthenticationFailed(_)));
        }
        assert_eq!(harness.endpoint.calls(), 3);
        assert_eq!(harness.connector.logins(), 3);
    }

    #[tokio::test]
    async fn revoked_refresh_token_with_cached_access_token_reports_expiry() {
        let mut harness = Harness::new(vec![oauth_account("o", Some(cached_token()))]);
        harness.endpoint.reply(400, r#"{"error":"invalid_grant"}"#);

        let err = harness.manager.connect(&id("o")).await.err().expect("token expired");
        assert_eq!(err, ConnectionError::TokenExpired);
        assert_eq!(harness.connector.logins(), 0);
        assert!(harness
            .drain_events()
            .contains(&NotifierEvent::TokenExpired(id("o"))));
    }

    #[tokio::test]
    async fn disabled_proxy_connects_directly() {
        let proxy = ProxyConfig {
            enabled: false,
            kind: ProxyKind::Socks5,
            host_port: "127.0.0.1:1080".to_string(),
            username: None,
            password: None,
        };
        let harness = Harness::with_proxy(vec![password_account("a")], Some(proxy));

        harness.manager.connect(&id("a")).await.expect("connected");
        let request = harness.connector.last_request().expect("connect called");
        assert!(request.proxy.is_none());
        assert_eq!(request.timeouts.connection, Duration::from_secs(8));
        assert!(matches!(
            request.credentials,
            crate::session::Credentials::Password { ref username, .. } if username == "a@example.com"
        ));
    }

    #[tokio::test]
    async fn proxied_connect_scales_timeouts() {
        let proxy = ProxyConfig {
            enabled: true,
            kind: ProxyKind::Http,
            host_port: "proxy.local:3128".to_string(),
            username: None,
            password: None,
        };
        let harness = Harness::with_proxy(vec![password_account("a")], Some(proxy));

        harness.manager.connect(&id("a")).await.expect("connected");
        let request = harness.connector.last_request().expect("connect called");
        assert_eq!(
            request.proxy.as_ref().map(|proxy| proxy.as_str().to_string()),
            Some("http://proxy.local:3128".to_string())
        );
        assert_eq!(request.timeouts.connection, Duration::from_secs(24));
        assert_eq!(request.timeouts.greeting, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn end_all_clears_everything_even_when_logouts_fail() {
        let harness = Harness::new(vec![password_account("a"), password_account("b")]);
        harness.manager.connect(&id("a")).await.expect("connected");
        harness.manager.connect(&id("b")).await.expect("connected");
        harness.connector.session(0).fail_logout();
        harness.connector.session(1).fail_logout();

        harness.manager.end_all().await;
        assert_eq!(harness.manager.connected_count().await, 0);
        assert_eq!(harness.manager.pending_count().await, 0);
        assert_eq!(harness.connector.session(0).closes(), 1);
        assert_eq!(harness.connector.session(1).closes(), 1);
    }

    #[tokio::test]
    async fn attempt_finishing_after_end_all_is_logged_out() {
        let harness = Harness::new(vec![password_account("a")]);
        harness.connector.set_delay(Duration::from_millis(100));

        let manager = harness.manager.clone();
        let waiter = tokio::spawn(async move { manager.connect(&id("a")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.manager.end_all().await;

        let result = waiter.await.expect("task joined");
        assert!(matches!(result, Err(ConnectionError::Generic(_))));
        assert_eq!(harness.manager.connected_count().await, 0);
        assert_eq!(harness.connector.session(0).logouts(), 1);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_cancel_the_attempt() {
        let harness = Harness::new(vec![password_account("a")]);
        harness.connector.set_delay(Duration::from_millis(50));

        let manager = harness.manager.clone();
        let abandoned = tokio::spawn(async move { manager.connect(&id("a")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(harness.manager.is_connected(&id("a")).await);
        assert_eq!(harness.connector.logins(), 1);
    }
}
