use crate::notifier::Notifier;
use crate::orchestrator::{ConnectionManager, Inner};
use crate::session::{MailboxLock, SessionEvent, SessionHandle};
use crate::ConnectionError;
use imapviewer_core::{AccountId, SpecialUse};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

const INBOX: &str = "INBOX";

pub(crate) enum WatcherSlot {
    /// Reserved by a `watch` call that has not finished locking yet.
    Starting(u64),
    Active(WatcherHandle),
}

pub(crate) struct WatcherHandle {
    generation: u64,
    mailbox_path: String,
    session: SessionHandle,
    lock: Box<dyn MailboxLock>,
    listener: JoinHandle<()>,
}

impl WatcherHandle {
    async fn shut_down(self) {
        self.listener.abort();
        self.lock.release().await;
    }
}

/// Messages that arrived between two counts. Shrinking counts report nothing.
pub(crate) fn new_mail_delta(previous: u32, current: u32) -> Option<u32> {
    current.checked_sub(previous).filter(|delta| *delta > 0)
}

/// Locks `INBOX`, falling back to whichever listed mailbox carries the inbox role.
pub(crate) async fn lock_inbox(
    session: &SessionHandle,
) -> Result<Box<dyn MailboxLock>, ConnectionError> {
    let err = match session.lock_mailbox(INBOX).await {
        Ok(lock) => return Ok(lock),
        Err(err) => err,
    };

    tracing::debug!(error = %err, "INBOX not selectable, looking for the inbox in LIST");
    let path = session
        .list_mailboxes()
        .await?
        .into_iter()
        .find(|entry| entry.special_use == Some(SpecialUse::Inbox) && entry.is_selectable())
        .map(|entry| entry.path)
        .ok_or_else(|| ConnectionError::MailboxNotFound(INBOX.to_string()))?;
    session.lock_mailbox(&path).await
}

impl ConnectionManager {
    /// Starts reporting new inbox mail for the account. Idempotent.
    pub async fn watch(&self, account_id: &AccountId) -> Result<(), ConnectionError> {
        let generation = self.next_id();
        {
            let mut watchers = self.inner.watchers.lock().await;
            if watchers.contains_key(account_id) {
                tracing::debug!(account_id = %account_id, "watcher already running");
                return Ok(());
            }
            watchers.insert(account_id.clone(), WatcherSlot::Starting(generation));
        }

        let started = self.start_watcher(account_id, generation).await;

        let mut watchers = self.inner.watchers.lock().await;
        let reserved = matches!(
            watchers.get(account_id),
            Some(WatcherSlot::Starting(current)) if *current == generation
        );
        match started {
            Ok(handle) if !handle.session.is_usable() => {
                if reserved {
                    watchers.remove(account_id);
                }
                drop(watchers);
                tracing::warn!(account_id = %account_id, "session closed while the watcher was starting");
                handle.shut_down().await;
                Err(ConnectionError::Generic(
                    "connection closed while starting the watcher".to_string(),
                ))
            }
            Ok(handle) if reserved => {
                tracing::info!(
                    account_id = %account_id,
                    mailbox = %handle.mailbox_path,
                    "watching for new mail"
                );
                watchers.insert(account_id.clone(), WatcherSlot::Active(handle));
                Ok(())
            }
            Ok(handle) => {
                drop(watchers);
                tracing::debug!(account_id = %account_id, "watcher stopped while starting");
                handle.shut_down().await;
                Ok(())
            }
            Err(err) => {
                if reserved {
                    watchers.remove(account_id);
                }
                tracing::warn!(account_id = %account_id, error = %err, "failed to start watcher");
                Err(err)
            }
        }
    }

    async fn start_watcher(
        &self,
        account_id: &AccountId,
        generation: u64,
    ) -> Result<WatcherHandle, ConnectionError> {
        let session = self.connect(account_id).await?;
        // subscribe first so no count published after the SELECT is missed
        let events = session.subscribe();
        let lock = lock_inbox(&session).await?;
        let mailbox_path = lock.path().to_string();

        let listener = tokio::spawn(listen(
            Arc::downgrade(&self.inner),
            self.inner.notifier.clone(),
            account_id.clone(),
            generation,
            mailbox_path.clone(),
            lock.exists(),
            events,
        ));

        Ok(WatcherHandle {
            generation,
            mailbox_path,
            session,
            lock,
            listener,
        })
    }

    /// Stops the account's watcher and releases its mailbox lock. No-op without one.
    pub async fn stop(&self, account_id: &AccountId) {
        let slot = self.inner.watchers.lock().await.remove(account_id);
        if let Some(WatcherSlot::Active(handle)) = slot {
            tracing::info!(account_id = %account_id, mailbox = %handle.mailbox_path, "watcher stopped");
            handle.shut_down().await;
        }
    }

    pub(crate) async fn stop_all(&self) {
        let drained: Vec<_> = self.inner.watchers.lock().await.drain().collect();
        for (account_id, slot) in drained {
            if let WatcherSlot::Active(handle) = slot {
                tracing::debug!(account_id = %account_id, "watcher stopped");
                handle.shut_down().await;
            }
        }
    }

    pub async fn is_watching(&self, account_id: &AccountId) -> bool {
        matches!(
            self.inner.watchers.lock().await.get(account_id),
            Some(WatcherSlot::Active(_))
        )
    }

    /// Drops a watcher whose session went away, unless it was already replaced.
    /// A slot still `Starting` under the same generation is dropped too, so `watch` tears it down.
    async fn forget_watcher(&self, account_id: &AccountId, generation: u64) {
        let removed = {
            let mut watchers = self.inner.watchers.lock().await;
            let ours = match watchers.get(account_id) {
                Some(WatcherSlot::Active(handle)) => handle.generation == generation,
                Some(WatcherSlot::Starting(current)) => *current == generation,
                None => false,
            };
            if ours {
                watchers.remove(account_id)
            } else {
                None
            }
        };
        if let Some(WatcherSlot::Active(handle)) = removed {
            tracing::info!(account_id = %account_id, "session closed, watcher ended");
            // the listener is this task; only the lock needs releasing
            handle.lock.release().await;
        }
    }
}

async fn listen(
    inner: Weak<Inner>,
    notifier: Arc<dyn Notifier>,
    account_id: AccountId,
    generation: u64,
    mailbox_path: String,
    mut last: u32,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::MessageCount { path, count }) if path == mailbox_path => {
                if let Some(delta) = new_mail_delta(last, count) {
                    notifier.on_new_mail(&account_id, &mailbox_path, delta);
                }
                last = count;
            }
            Ok(SessionEvent::MessageCount { .. }) => {}
            Ok(SessionEvent::Closed) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(account_id = %account_id, skipped, "watcher lagged behind session events");
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        ConnectionManager { inner }
            .forget_watcher(&account_id, generation)
            .await;
    }
}
