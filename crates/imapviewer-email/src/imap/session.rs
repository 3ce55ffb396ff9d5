use crate::imap::connect::ImapStream;
use crate::imap::parse::{header_from_fetch, mailbox_entry, message_body};
use crate::session::{MailSession, MailboxLock, SequenceRange, SessionEvent};
use crate::ConnectionError;
use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use async_imap::types::{Fetch, Name, UnsolicitedResponse};
use async_trait::async_trait;
use futures::TryStreamExt;
use imapviewer_core::{AccountId, MailHeader, MailboxEntry, MessageBody};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;

const HEADER_QUERY: &str = "(UID FLAGS ENVELOPE INTERNALDATE RFC822.SIZE)";
const BODY_QUERY: &str = "(UID BODY.PEEK[])";
const EVENT_CAPACITY: usize = 64;

type RawSession = async_imap::Session<ImapStream>;

struct ClientState {
    session: RawSession,
    selected: Option<String>,
    exists: u32,
}

#[derive(Default)]
struct Claims {
    next: u64,
    held: Vec<(u64, String)>,
    idle_task: Option<JoinHandle<()>>,
}

/// State shared by the session handle, its mailbox locks and the IDLE task.
struct Shared {
    account_id: AccountId,
    conn: Mutex<Option<ClientState>>,
    usable: AtomicBool,
    closed_sent: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
    interrupt: Notify,
    claims: std::sync::Mutex<Claims>,
    idle_timeout: Duration,
}

impl Shared {
    fn claims(&self) -> std::sync::MutexGuard<'_, Claims> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_count(&self, state: &mut ClientState, count: u32) {
        state.exists = count;
        if let Some(path) = state.selected.clone() {
            let _ = self.events.send(SessionEvent::MessageCount { path, count });
        }
    }

    fn publish_closed(&self) {
        if !self.closed_sent.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(SessionEvent::Closed);
        }
    }

    fn drain_unsolicited(&self, state: &mut ClientState) {
        while let Ok(response) = state.session.unsolicited_responses.try_recv() {
            match response {
                UnsolicitedResponse::Exists(count) => self.publish_count(state, count),
                UnsolicitedResponse::Expunge(_) => {
                    let count = state.exists.saturating_sub(1);
                    self.publish_count(state, count);
                }
                _ => {}
            }
        }
    }

    fn apply_idle_data(&self, state: &mut ClientState, response: &Response<'_>) {
        match response {
            Response::MailboxData(MailboxDatum::Exists(count)) => self.publish_count(state, *count),
            Response::Expunge(_) => {
                let count = state.exists.saturating_sub(1);
                self.publish_count(state, count);
            }
            _ => {}
        }
    }

    /// Converts a protocol error, retiring the session when the transport is gone.
    fn check<T>(&self, result: Result<T, async_imap::error::Error>) -> Result<T, ConnectionError> {
        result.map_err(|err| {
            if matches!(
                err,
                async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost
            ) {
                self.mark_broken();
            }
            ConnectionError::from(err)
        })
    }

    fn mark_broken(&self) {
        if self.usable.swap(false, Ordering::SeqCst) {
            tracing::warn!(account_id = %self.account_id, "imap connection lost");
        }
        self.publish_closed();
    }

    async fn select(&self, state: &mut ClientState, path: &str) -> Result<u32, ConnectionError> {
        let mailbox = state.session.select(path).await.map_err(|err| match err {
            async_imap::error::Error::No(_) | async_imap::error::Error::Bad(_) => {
                ConnectionError::MailboxNotFound(path.to_string())
            }
            other => {
                if matches!(
                    other,
                    async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost
                ) {
                    self.mark_broken();
                }
                ConnectionError::from(other)
            }
        })?;
        state.selected = Some(path.to_string());
        self.publish_count(state, mailbox.exists);
        self.drain_unsolicited(state);
        Ok(state.exists)
    }

    fn claim(self: &Arc<Self>, path: &str) -> u64 {
        let mut claims = self.claims();
        let id = claims.next;
        claims.next += 1;
        claims.held.push((id, path.to_string()));

        let idle_running = claims
            .idle_task
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if !idle_running {
            claims.idle_task = Some(tokio::spawn(idle_loop(Arc::clone(self))));
        }
        id
    }

    fn unclaim(&self, id: u64) {
        self.claims().held.retain(|(claim, _)| *claim != id);
        self.interrupt.notify_one();
    }

    /// Mailbox the IDLE task should watch. Clears the task slot when nothing is held.
    fn idle_target(&self) -> Option<String> {
        let mut claims = self.claims();
        match claims.held.last() {
            Some((_, path)) if self.usable.load(Ordering::SeqCst) => Some(path.clone()),
            _ => {
                claims.idle_task = None;
                None
            }
        }
    }

    fn shut_down(&self) {
        self.usable.store(false, Ordering::SeqCst);
        self.claims().held.clear();
        self.interrupt.notify_one();
    }

    fn abort_idle(&self) {
        if let Some(task) = self.claims().idle_task.take() {
            task.abort();
        }
    }
}

async fn idle_loop(shared: Arc<Shared>) {
    loop {
        let Some(path) = shared.idle_target() else {
            return;
        };

        let mut guard = shared.conn.lock().await;
        let Some(state) = guard.take() else {
            return;
        };

        match idle_once(&shared, state, &path).await {
            Ok(state) => *guard = Some(state),
            Err(err) => {
                drop(guard);
                tracing::warn!(account_id = %shared.account_id, mailbox = %path, error = %err, "idle failed");
                shared.mark_broken();
                shared.claims().idle_task = None;
                return;
            }
        }
        drop(guard);
        tokio::task::yield_now().await;
    }
}

async fn idle_once(
    shared: &Shared,
    mut state: ClientState,
    path: &str,
) -> Result<ClientState, async_imap::error::Error> {
    if state.selected.as_deref() != Some(path) {
        let mailbox = state.session.select(path).await?;
        state.selected = Some(path.to_string());
        shared.publish_count(&mut state, mailbox.exists);
    }
    shared.drain_unsolicited(&mut state);

    let ClientState {
        session,
        selected,
        exists,
    } = state;

    let mut handle = session.idle();
    handle.init().await?;

    let outcome = {
        let (wait, _stop) = handle.wait_with_timeout(shared.idle_timeout);
        tokio::select! {
            result = wait => Some(result),
            _ = shared.interrupt.notified() => None,
        }
    };

    let session = handle.done().await?;
    let mut state = ClientState {
        session,
        selected,
        exists,
    };

    match outcome {
        Some(Ok(IdleResponse::NewData(data))) => shared.apply_idle_data(&mut state, data.parsed()),
        Some(Ok(_)) | None => {}
        Some(Err(err)) => return Err(err),
    }
    shared.drain_unsolicited(&mut state);

    Ok(state)
}

/// Production [`MailSession`] backed by an `async-imap` session.
pub struct ImapSession {
    shared: Arc<Shared>,
}

impl ImapSession {
    pub(crate) fn new(account_id: AccountId, session: RawSession, idle_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                account_id,
                conn: Mutex::new(Some(ClientState {
                    session,
                    selected: None,
                    exists: 0,
                })),
                usable: AtomicBool::new(true),
                closed_sent: AtomicBool::new(false),
                events,
                interrupt: Notify::new(),
                claims: std::sync::Mutex::new(Claims::default()),
                idle_timeout,
            }),
        }
    }

    /// Interrupts IDLE and waits for exclusive use of the connection.
    async fn command(&self) -> Result<MutexGuard<'_, Option<ClientState>>, ConnectionError> {
        if !self.is_usable() {
            return Err(closed());
        }
        self.shared.interrupt.notify_one();
        let guard = self.shared.conn.lock().await;
        if guard.is_none() {
            return Err(closed());
        }
        Ok(guard)
    }

    async fn ensure_selected(&self, state: &mut ClientState, path: &str) -> Result<(), ConnectionError> {
        if state.selected.as_deref() != Some(path) {
            self.shared.select(state, path).await?;
        }
        Ok(())
    }
}

fn closed() -> ConnectionError {
    ConnectionError::Generic("session is closed".to_string())
}

impl Drop for ImapSession {
    fn drop(&mut self) {
        self.shared.shut_down();
        self.shared.abort_idle();
    }
}

#[async_trait]
impl MailSession for ImapSession {
    fn is_usable(&self) -> bool {
        self.shared.usable.load(Ordering::SeqCst)
    }

    async fn list_mailboxes(&self) -> Result<Vec<MailboxEntry>, ConnectionError> {
        let mut guard = self.command().await?;
        let state = guard.as_mut().ok_or_else(closed)?;

        let stream = self.shared.check(state.session.list(Some(""), Some("*")).await)?;
        let names: Result<Vec<Name>, _> = stream.try_collect().await;
        let names = self.shared.check(names)?;
        self.shared.drain_unsolicited(state);

        Ok(names.iter().map(mailbox_entry).collect())
    }

    async fn lock_mailbox(&self, path: &str) -> Result<Box<dyn MailboxLock>, ConnectionError> {
        let exists = {
            let mut guard = self.command().await?;
            let state = guard.as_mut().ok_or_else(closed)?;
            self.shared.select(state, path).await?
        };

        let claim = self.shared.claim(path);
        tracing::debug!(account_id = %self.shared.account_id, mailbox = path, exists, "mailbox locked");

        Ok(Box::new(ImapMailboxLock {
            shared: Arc::clone(&self.shared),
            path: path.to_string(),
            exists,
            claim,
            released: AtomicBool::new(false),
        }))
    }

    async fn fetch_headers(
        &self,
        path: &str,
        range: SequenceRange,
    ) -> Result<Vec<MailHeader>, ConnectionError> {
        let mut guard = self.command().await?;
        let state = guard.as_mut().ok_or_else(closed)?;
        self.ensure_selected(state, path).await?;

        let stream = self
            .shared
            .check(state.session.fetch(range.to_string(), HEADER_QUERY).await)?;
        let fetches: Result<Vec<Fetch>, _> = stream.try_collect().await;
        let fetches = self.shared.check(fetches)?;
        self.shared.drain_unsolicited(state);

        let mut headers: Vec<MailHeader> = fetches.iter().map(header_from_fetch).collect();
        headers.sort_by_key(|header| header.seq);
        Ok(headers)
    }

    async fn fetch_body(&self, path: &str, uid: u32) -> Result<Option<MessageBody>, ConnectionError> {
        let mut guard = self.command().await?;
        let state = guard.as_mut().ok_or_else(closed)?;
        self.ensure_selected(state, path).await?;

        let stream = self
            .shared
            .check(state.session.uid_fetch(uid.to_string(), BODY_QUERY).await)?;
        let fetches: Result<Vec<Fetch>, _> = stream.try_collect().await;
        let fetches = self.shared.check(fetches)?;
        self.shared.drain_unsolicited(state);

        let Some(raw) = fetches.iter().find_map(|fetch| fetch.body()) else {
            return Ok(None);
        };
        message_body(uid, raw)
            .map(Some)
            .map_err(|err| ConnectionError::Generic(format!("message {uid} could not be parsed: {err}")))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    async fn logout(&self) -> Result<(), ConnectionError> {
        self.shared.shut_down();
        let taken = self.shared.conn.lock().await.take();
        self.shared.abort_idle();

        let result = match taken {
            Some(mut state) => state.session.logout().await.map_err(ConnectionError::from),
            None => Ok(()),
        };
        self.shared.publish_closed();
        result
    }

    async fn close(&self) {
        self.shared.shut_down();
        self.shared.abort_idle();
        // dropping the client closes the socket
        drop(self.shared.conn.lock().await.take());
        self.shared.publish_closed();
    }
}

struct ImapMailboxLock {
    shared: Arc<Shared>,
    path: String,
    exists: u32,
    claim: u64,
    released: AtomicBool,
}

impl ImapMailboxLock {
    fn release_claim(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.shared.unclaim(self.claim);
            tracing::debug!(account_id = %self.shared.account_id, mailbox = %self.path, "mailbox released");
        }
    }
}

#[async_trait]
impl MailboxLock for ImapMailboxLock {
    fn path(&self) -> &str {
        &self.path
    }

    fn exists(&self) -> u32 {
        self.exists
    }

    async fn release(&self) {
        self.release_claim();
    }
}

impl Drop for ImapMailboxLock {
    fn drop(&mut self) {
        self.release_claim();
    }
}
