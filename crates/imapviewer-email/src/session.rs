use crate::ConnectionError;
use async_trait::async_trait;
use imapviewer_core::{AccountId, MailHeader, MailboxEntry, MessageBody, ProxyUrl};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub type SessionHandle = Arc<dyn MailSession>;

/// Login material handed to the connector.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { username: String, password: String },
    XOAuth2 { user: String, access_token: String },
}

impl Credentials {
    pub fn username(&self) -> &str {
        match self {
            Self::Password { username, .. } => username,
            Self::XOAuth2 { user, .. } => user,
        }
    }

    /// SASL XOAUTH2 initial response, before base64 encoding.
    pub fn xoauth2_string(user: &str, access_token: &str) -> String {
        format!("user={user}\x01auth=Bearer {access_token}\x01\x01")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::XOAuth2 { user, .. } => f
                .debug_struct("XOAuth2")
                .field("user", user)
                .field("access_token", &"[REDACTED]")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectTimeouts {
    pub connection: Duration,
    pub greeting: Duration,
}

impl ConnectTimeouts {
    pub fn scaled(self, multiplier: u32) -> Self {
        let multiplier = multiplier.max(1);
        Self {
            connection: self.connection * multiplier,
            greeting: self.greeting * multiplier,
        }
    }
}

impl Default for ConnectTimeouts {
    fn default() -> Self {
        Self {
            connection: Duration::from_secs(8),
            greeting: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub account_id: AccountId,
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub credentials: Credentials,
    pub proxy: Option<ProxyUrl>,
    pub timeouts: ConnectTimeouts,
}

/// Inclusive message sequence range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    pub start: u32,
    pub end: u32,
}

impl SequenceRange {
    /// The newest `limit` messages of a mailbox holding `total`, or none when empty.
    pub fn newest(total: u32, limit: usize) -> Option<Self> {
        if total == 0 || limit == 0 {
            return None;
        }
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        Some(Self {
            start: total.saturating_sub(limit).saturating_add(1).max(1),
            end: total,
        })
    }
}

impl fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Server reported a new message count for a held mailbox.
    MessageCount { path: String, count: u32 },
    Closed,
}

/// Opens authenticated sessions.
#[async_trait]
pub trait MailConnector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<SessionHandle, ConnectionError>;
}

/// A live authenticated connection to one account.
#[async_trait]
pub trait MailSession: Send + Sync {
    /// True until logout, close or a fatal protocol error.
    fn is_usable(&self) -> bool;

    async fn list_mailboxes(&self) -> Result<Vec<MailboxEntry>, ConnectionError>;

    /// Selects `path` and keeps it selected while the lock is held.
    async fn lock_mailbox(&self, path: &str) -> Result<Box<dyn MailboxLock>, ConnectionError>;

    /// Headers in ascending sequence order.
    async fn fetch_headers(
        &self,
        path: &str,
        range: SequenceRange,
    ) -> Result<Vec<MailHeader>, ConnectionError>;

    async fn fetch_body(&self, path: &str, uid: u32) -> Result<Option<MessageBody>, ConnectionError>;

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    async fn logout(&self) -> Result<(), ConnectionError>;

    async fn close(&self);
}

#[async_trait]
pub trait MailboxLock: Send + Sync {
    fn path(&self) -> &str;

    /// Message count observed when the lock was taken.
    fn exists(&self) -> u32;

    /// Idempotent.
    async fn release(&self);
}

pub(crate) fn same_session(left: &SessionHandle, right: &SessionHandle) -> bool {
    std::ptr::eq(
        Arc::as_ptr(left) as *const (),
        Arc::as_ptr(right) as *const (),
    )
}
