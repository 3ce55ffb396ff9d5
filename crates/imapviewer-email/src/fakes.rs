//! In-memory collaborators for unit tests.

use crate::notifier::{ChannelNotifier, NotifierEvent};
use crate::orchestrator::{ConnectionManager, ManagerSettings};
use crate::session::{
    ConnectRequest, MailConnector, MailSession, MailboxLock, SequenceRange, SessionEvent,
    SessionHandle,
};
use crate::ConnectionError;
use async_trait::async_trait;
use imapviewer_core::{
    Account, AccountId, AuthConfig, CachedToken, IncomingServer, MailHeader, MailboxEntry,
    MemoryAccounts, MessageBody, ProxyConfig, ProxyUrl, StaticProxy,
};
use imapviewer_security::{TokenEndpoint, TokenError, TokenHttpResponse, TokenProvider};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const DEFAULT_EXISTS: u32 = 10;

pub(crate) fn password_account(id: &str) -> Account {
    Account {
        id: AccountId::from(id),
        email: format!("{id}@example.com"),
        display_name: None,
        incoming: IncomingServer {
            host: "imap.example.com".to_string(),
            port: 993,
            secure: true,
            username: None,
        },
        auth: AuthConfig::Password {
            password: "secret".to_string(),
        },
    }
}

pub(crate) fn oauth_account(id: &str, cached: Option<CachedToken>) -> Account {
    Account {
        auth: AuthConfig::OAuth2 {
            client_id: "client".to_string(),
            refresh_token: "refresh".to_string(),
            cached,
        },
        ..password_account(id)
    }
}

#[derive(Default)]
struct SessionState {
    exists: u32,
    usable: bool,
    fail_logout: bool,
    fail_fetches: bool,
    reject_inbox: bool,
    close_after_lock: bool,
    logouts: usize,
    closes: usize,
    lock_calls: usize,
    list_calls: usize,
    held: Vec<(u64, String)>,
}

pub(crate) struct FakeSession {
    state: Arc<Mutex<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    next_lock: AtomicU64,
}

impl FakeSession {
    pub(crate) fn new(exists: u32) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            state: Arc::new(Mutex::new(SessionState {
                exists,
                usable: true,
                ..SessionState::default()
            })),
            events,
            next_lock: AtomicU64::new(1),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("fake session state")
    }

    pub(crate) fn break_connection(&self) {
        self.state().usable = false;
        let _ = self.events.send(SessionEvent::Closed);
    }

    pub(crate) fn fail_logout(&self) {
        self.state().fail_logout = true;
    }

    pub(crate) fn fail_fetches(&self) {
        self.state().fail_fetches = true;
    }

    /// Hides `INBOX` by name; LIST reports it as `Inbox` instead.
    pub(crate) fn reject_inbox(&self) {
        self.state().reject_inbox = true;
    }

    /// The next mailbox lock succeeds, then the connection drops.
    pub(crate) fn close_after_lock(&self) {
        self.state().close_after_lock = true;
    }

    pub(crate) fn set_count(&self, count: u32) {
        self.state().exists = count;
        let _ = self.events.send(SessionEvent::MessageCount {
            path: "INBOX".to_string(),
            count,
        });
    }

    pub(crate) fn logouts(&self) -> usize {
        self.state().logouts
    }

    pub(crate) fn closes(&self) -> usize {
        self.state().closes
    }

    pub(crate) fn lock_calls(&self) -> usize {
        self.state().lock_calls
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub(crate) fn held_locks(&self) -> Vec<String> {
        self.state().held.iter().map(|(_, path)| path.clone()).collect()
    }

    fn ensure_fetchable(&self) -> Result<(), ConnectionError> {
        let state = self.state();
        if !state.usable {
            return Err(ConnectionError::Generic("connection closed".to_string()));
        }
        if state.fail_fetches {
            return Err(ConnectionError::Generic("fetch failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MailSession for FakeSession {
    fn is_usable(&self) -> bool {
        self.state().usable
    }

    async fn list_mailboxes(&self) -> Result<Vec<MailboxEntry>, ConnectionError> {
        self.state().list_calls += 1;
        self.ensure_fetchable()?;
        let inbox = if self.state().reject_inbox { "Inbox" } else { "INBOX" };
        Ok(vec![
            MailboxEntry::new(inbox, Some("/"), Vec::new()),
            MailboxEntry::new("Sent", Some("/"), vec!["\\Sent".to_string()]),
            MailboxEntry::new("Work", Some("/"), Vec::new()),
            MailboxEntry::new("Work/Projects", Some("/"), Vec::new()),
        ])
    }

    async fn lock_mailbox(&self, path: &str) -> Result<Box<dyn MailboxLock>, ConnectionError> {
        let id = self.next_lock.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        state.lock_calls += 1;
        if !state.usable {
            return Err(ConnectionError::Generic("connection closed".to_string()));
        }
        if state.reject_inbox && path == "INBOX" {
            return Err(ConnectionError::MailboxNotFound(path.to_string()));
        }
        state.held.push((id, path.to_string()));
        let lock: Box<dyn MailboxLock> = Box::new(FakeLock {
            id,
            path: path.to_string(),
            exists: state.exists,
            state: self.state.clone(),
            released: AtomicBool::new(false),
        });
        if std::mem::take(&mut state.close_after_lock) {
            state.usable = false;
            let _ = self.events.send(SessionEvent::Closed);
        }
        Ok(lock)
    }

    async fn fetch_headers(
        &self,
        _path: &str,
        range: SequenceRange,
    ) -> Result<Vec<MailHeader>, ConnectionError> {
        self.ensure_fetchable()?;
        Ok((range.start..=range.end)
            .map(|seq| MailHeader {
                seq,
                uid: Some(seq),
                subject: format!("Message {seq}"),
                from: Vec::new(),
                date: None,
                seen: false,
                flagged: false,
                size: None,
            })
            .collect())
    }

    async fn fetch_body(&self, _path: &str, uid: u32) -> Result<Option<MessageBody>, ConnectionError> {
        self.ensure_fetchable()?;
        if uid == 0 || uid > self.state().exists {
            return Ok(None);
        }
        Ok(Some(MessageBody {
            uid,
            subject: Some(format!("Message {uid}")),
            text: Some("hello".to_string()),
            html: None,
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn logout(&self) -> Result<(), ConnectionError> {
        let mut state = self.state();
        state.logouts += 1;
        if state.fail_logout {
            return Err(ConnectionError::Generic("logout rejected".to_string()));
        }
        state.usable = false;
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state();
        state.closes += 1;
        state.usable = false;
    }
}

struct FakeLock {
    id: u64,
    path: String,
    exists: u32,
    state: Arc<Mutex<SessionState>>,
    released: AtomicBool,
}

#[async_trait]
impl MailboxLock for FakeLock {
    fn path(&self) -> &str {
        &self.path
    }

    fn exists(&self) -> u32 {
        self.exists
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state
            .lock()
            .expect("fake session state")
            .held
            .retain(|(id, _)| *id != self.id);
    }
}

#[derive(Default)]
struct ConnectorState {
    delay: Option<Duration>,
    failure: Option<ConnectionError>,
    fail_fetches: bool,
    requests: Vec<ConnectRequest>,
    sessions: Vec<Arc<FakeSession>>,
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    state: Mutex<ConnectorState>,
}

impl FakeConnector {
    fn state(&self) -> std::sync::MutexGuard<'_, ConnectorState> {
        self.state.lock().expect("fake connector state")
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    pub(crate) fn fail_with(&self, err: ConnectionError) {
        self.state().failure = Some(err);
    }

    /// Sessions opened from now on fail LIST and FETCH.
    pub(crate) fn fail_fetches(&self) {
        self.state().fail_fetches = true;
    }

    pub(crate) fn logins(&self) -> usize {
        self.state().requests.len()
    }

    pub(crate) fn last_request(&self) -> Option<ConnectRequest> {
        self.state().requests.last().cloned()
    }

    pub(crate) fn session(&self, index: usize) -> Arc<FakeSession> {
        self.state().sessions[index].clone()
    }
}

#[async_trait]
impl MailConnector for FakeConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<SessionHandle, ConnectionError> {
        let delay = {
            let mut state = self.state();
            state.requests.push(request);
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(err) = state.failure.clone() {
            return Err(err);
        }
        let session = FakeSession::new(DEFAULT_EXISTS);
        if state.fail_fetches {
            session.fail_fetches();
        }
        state.sessions.push(session.clone());
        Ok(session)
    }
}

#[derive(Default)]
pub(crate) struct ScriptedEndpoint {
    replies: Mutex<VecDeque<TokenHttpResponse>>,
    calls: Mutex<usize>,
}

impl ScriptedEndpoint {
    pub(crate) fn reply(&self, status: u16, body: &str) {
        self.replies
            .lock()
            .expect("scripted replies")
            .push_back(TokenHttpResponse {
                status,
                body: body.to_string(),
            });
    }

    pub(crate) fn calls(&self) -> usize {
        *self.calls.lock().expect("scripted calls")
    }
}

#[async_trait]
impl TokenEndpoint for ScriptedEndpoint {
    async fn post_form(
        &self,
        _params: &[(&'static str, String)],
        _proxy: Option<&ProxyUrl>,
    ) -> Result<TokenHttpResponse, TokenError> {
        *self.calls.lock().expect("scripted calls") += 1;
        self.replies
            .lock()
            .expect("scripted replies")
            .pop_front()
            .ok_or_else(|| TokenError::Other("no scripted reply".to_string()))
    }
}

pub(crate) struct Harness {
    pub(crate) manager: ConnectionManager,
    pub(crate) connector: Arc<FakeConnector>,
    pub(crate) endpoint: Arc<ScriptedEndpoint>,
    events: mpsc::UnboundedReceiver<NotifierEvent>,
}

impl Harness {
    pub(crate) fn new(accounts: Vec<Account>) -> Self {
        Self::with_proxy(accounts, None)
    }

    pub(crate) fn with_proxy(accounts: Vec<Account>, proxy: Option<ProxyConfig>) -> Self {
        let connector = Arc::new(FakeConnector::default());
        let endpoint = Arc::new(ScriptedEndpoint::default());
        let (notifier, events) = ChannelNotifier::new();
        let manager = ConnectionManager::new(
            Arc::new(MemoryAccounts::new(accounts)),
            Arc::new(StaticProxy(proxy)),
            TokenProvider::new(endpoint.clone()),
            connector.clone(),
            Arc::new(notifier),
            ManagerSettings::default(),
        );
        Self {
            manager,
            connector,
            endpoint,
            events,
        }
    }

    pub(crate) fn drain_events(&mut self) -> Vec<NotifierEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Waits for the next event matching `wanted`, skipping others.
    pub(crate) async fn next_event(
        &mut self,
        wanted: impl Fn(&NotifierEvent) -> bool,
    ) -> NotifierEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match self.events.recv().await {
                    Some(event) if wanted(&event) => return event,
                    Some(_) => continue,
                    None => panic!("notifier channel closed"),
                }
            }
        })
        .await
        .expect("event before timeout")
    }
}
