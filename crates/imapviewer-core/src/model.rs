use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::form_urlencoded;
use url::Url;

/// Stable identifier of a configured mail account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncomingServer {
    pub host: String,
    pub port: u16,
    /// Implicit TLS when true, STARTTLS upgrade otherwise.
    #[serde(default = "default_secure")]
    pub secure: bool,
    /// Login name when it differs from the account email.
    #[serde(default)]
    pub username: Option<String>,
}

fn default_secure() -> bool {
    true
}

/// Last access token handed out for an OAuth2 account. Kept for the host; connects always refresh.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedToken")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    Password {
        password: String,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        client_id: String,
        refresh_token: String,
        #[serde(default)]
        cached: Option<CachedToken>,
    },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"[REDACTED]")
                .finish(),
            Self::OAuth2 {
                client_id, cached, ..
            } => f
                .debug_struct("OAuth2")
                .field("client_id", client_id)
                .field("refresh_token", &"[REDACTED]")
                .field("cached", cached)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub incoming: IncomingServer,
    pub auth: AuthConfig,
}

impl Account {
    pub fn login_name(&self) -> &str {
        self.incoming.username.as_deref().unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyKind {
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Global proxy setting as the user configured it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type", default)]
    pub kind: ProxyKind,
    #[serde(default)]
    pub host_port: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Splits `host_port` into its parts. Bracketed IPv6 hosts keep their brackets.
    pub fn endpoint(&self) -> Option<(String, u16)> {
        let trimmed = self.host_port.trim();
        let (host, port) = trimmed.rsplit_once(':')?;
        if host.is_empty() || (host.contains(':') && !host.starts_with('[')) {
            return None;
        }
        let port = port.parse::<u16>().ok().filter(|port| *port != 0)?;
        Some((host.to_string(), port))
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("enabled", &self.enabled)
            .field("kind", &self.kind)
            .field("host_port", &self.host_port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Resolved proxy location with credentials embedded in userinfo.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyUrl {
    kind: ProxyKind,
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    url: String,
}

impl ProxyUrl {
    pub fn new(
        kind: ProxyKind,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, url::ParseError> {
        let username = username.filter(|value| !value.is_empty());
        let password = password.filter(|value| !value.is_empty());
        let userinfo = match (username, password) {
            (Some(user), Some(pass)) => {
                format!("{}:{}@", encode_userinfo(user), encode_userinfo(pass))
            }
            (Some(user), None) => format!("{}@", encode_userinfo(user)),
            _ => String::new(),
        };
        let url = format!("{}://{userinfo}{host}:{port}", kind.scheme());
        Url::parse(&url)?;

        Ok(Self {
            kind,
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            username: username.map(str::to_string),
            password: if username.is_some() {
                password.map(str::to_string)
            } else {
                None
            },
            url,
        })
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .map(|user| (user, self.password.as_deref().unwrap_or("")))
    }

    /// Full URL including credentials. Never log this.
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Scheme, host and port only.
    pub fn redacted(&self) -> String {
        format!("{}://{}:{}", self.kind.scheme(), self.host, self.port)
    }
}

impl fmt::Debug for ProxyUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProxyUrl").field(&self.redacted()).finish()
    }
}

fn encode_userinfo(value: &str) -> String {
    // form encoding writes spaces as '+'; literal '+' is already %2B
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// OAuth2 token material produced by a refresh exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
    pub token_type: String,
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpecialUse {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Junk,
    Archive,
    All,
    Flagged,
}

impl SpecialUse {
    /// Maps an RFC 6154 attribute such as `\Sent` to its role.
    pub fn from_attribute(attribute: &str) -> Option<Self> {
        let name = attribute.trim_start_matches('\\').to_ascii_lowercase();
        match name.as_str() {
            "inbox" => Some(Self::Inbox),
            "sent" => Some(Self::Sent),
            "drafts" => Some(Self::Drafts),
            "trash" => Some(Self::Trash),
            "junk" | "spam" => Some(Self::Junk),
            "archive" => Some(Self::Archive),
            "all" => Some(Self::All),
            "flagged" => Some(Self::Flagged),
            _ => None,
        }
    }
}

/// One row of a LIST response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailboxEntry {
    pub path: String,
    pub delimiter: Option<String>,
    pub flags: Vec<String>,
    pub special_use: Option<SpecialUse>,
}

impl MailboxEntry {
    pub fn new(path: impl Into<String>, delimiter: Option<&str>, flags: Vec<String>) -> Self {
        let path = path.into();
        let special_use = if path.eq_ignore_ascii_case("INBOX") {
            Some(SpecialUse::Inbox)
        } else {
            flags.iter().find_map(|flag| SpecialUse::from_attribute(flag))
        };
        Self {
            path,
            delimiter: delimiter.map(str::to_string),
            flags,
            special_use,
        }
    }

    pub fn is_selectable(&self) -> bool {
        !self
            .flags
            .iter()
            .any(|flag| flag.eq_ignore_ascii_case("\\Noselect") || flag.eq_ignore_ascii_case("\\NonExistent"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailboxNode {
    pub name: String,
    pub path: String,
    pub delimiter: Option<String>,
    pub special_use: Option<SpecialUse>,
    pub flags: Vec<String>,
    pub selectable: bool,
    pub children: Vec<MailboxNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailAddress {
    pub name: Option<String>,
    pub address: String,
}

/// Envelope-level summary of one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailHeader {
    pub seq: u32,
    pub uid: Option<u32>,
    pub subject: String,
    pub from: Vec<MailAddress>,
    pub date: Option<DateTime<Utc>>,
    pub seen: bool,
    pub flagged: bool,
    pub size: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageBody {
    pub uid: u32,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
}

/// Folder tree plus the newest messages of the inbox, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitialSync {
    pub mailbox_tree: Vec<MailboxNode>,
    pub initial_emails: Vec<MailHeader>,
}
