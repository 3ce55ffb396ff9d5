use imapviewer_core::{AccountId, ConnectionStatus, LogLevel, TokenState};
use tokio::sync::mpsc;

/// Host-side sink for status transitions and events.
pub trait Notifier: Send + Sync {
    fn on_status_change(&self, account_id: &AccountId, status: ConnectionStatus, detail: Option<&str>);

    fn on_log(&self, account_id: &AccountId, level: LogLevel, message: &str);

    /// The refresh token was rejected; the host should start re-authentication.
    fn on_token_expired(&self, account_id: &AccountId);

    fn on_new_mail(&self, account_id: &AccountId, mailbox_path: &str, delta: u32);

    /// A refresh exchange produced a new access token the host may cache.
    fn on_token_refreshed(&self, _account_id: &AccountId, _token: &TokenState) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn on_status_change(&self, account_id: &AccountId, status: ConnectionStatus, detail: Option<&str>) {
        match detail {
            Some(detail) => tracing::info!(account_id = %account_id, %status, detail, "connection status changed"),
            None => tracing::info!(account_id = %account_id, %status, "connection status changed"),
        }
    }

    fn on_log(&self, account_id: &AccountId, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(account_id = %account_id, "{message}"),
            LogLevel::Info => tracing::info!(account_id = %account_id, "{message}"),
            LogLevel::Warn => tracing::warn!(account_id = %account_id, "{message}"),
            LogLevel::Error => tracing::error!(account_id = %account_id, "{message}"),
        }
    }

    fn on_token_expired(&self, account_id: &AccountId) {
        tracing::warn!(account_id = %account_id, "refresh token expired, re-authentication required");
    }

    fn on_new_mail(&self, account_id: &AccountId, mailbox_path: &str, delta: u32) {
        tracing::info!(account_id = %account_id, mailbox = mailbox_path, delta, "new mail");
    }

    fn on_token_refreshed(&self, account_id: &AccountId, token: &TokenState) {
        tracing::debug!(account_id = %account_id, expires_at = %token.expires_at, "access token refreshed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    Status {
        account_id: AccountId,
        status: ConnectionStatus,
        detail: Option<String>,
    },
    Log {
        account_id: AccountId,
        level: LogLevel,
        message: String,
    },
    TokenExpired(AccountId),
    NewMail {
        account_id: AccountId,
        mailbox_path: String,
        delta: u32,
    },
    TokenRefreshed {
        account_id: AccountId,
        token: TokenState,
    },
}

/// Forwards every notification into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<NotifierEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotifierEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: NotifierEvent) {
        // receiver gone means the host stopped listening
        let _ = self.tx.send(event);
    }
}

impl Notifier for ChannelNotifier {
    fn on_status_change(&self, account_id: &AccountId, status: ConnectionStatus, detail: Option<&str>) {
        self.send(NotifierEvent::Status {
            account_id: account_id.clone(),
            status,
            detail: detail.map(str::to_string),
        });
    }

    fn on_log(&self, account_id: &AccountId, level: LogLevel, message: &str) {
        self.send(NotifierEvent::Log {
            account_id: account_id.clone(),
            level,
            message: message.to_string(),
        });
    }

    fn on_token_expired(&self, account_id: &AccountId) {
        self.send(NotifierEvent::TokenExpired(account_id.clone()));
    }

    fn on_new_mail(&self, account_id: &AccountId, mailbox_path: &str, delta: u32) {
        self.send(NotifierEvent::NewMail {
            account_id: account_id.clone(),
            mailbox_path: mailbox_path.to_string(),
            delta,
        });
    }

    fn on_token_refreshed(&self, account_id: &AccountId, token: &TokenState) {
        self.send(NotifierEvent::TokenRefreshed {
            account_id: account_id.clone(),
            token: token.clone(),
        });
    }
}
