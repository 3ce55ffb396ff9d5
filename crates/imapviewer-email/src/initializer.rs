use crate::orchestrator::ConnectionManager;
use crate::session::SequenceRange;
use crate::tree::build_mailbox_tree;
use crate::watcher::lock_inbox;
use crate::ConnectionError;
use futures::future::{BoxFuture, FutureExt, Shared};
use imapviewer_core::{AccountId, InitialSync};
use std::panic::AssertUnwindSafe;

pub(crate) type SharedInit = Shared<BoxFuture<'static, Result<InitialSync, ConnectionError>>>;

impl ConnectionManager {
    /// Fresh session, folder tree and the newest `limit` inbox headers.
    ///
    /// Concurrent calls for one account share a single run. The run replaces
    /// any existing session and its watcher.
    pub async fn initialize(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<InitialSync, ConnectionError> {
        let shared = {
            let mut locks = self.inner.init_locks.lock().await;
            match locks.get(account_id) {
                Some(pending) => {
                    tracing::debug!(account_id = %account_id, "joining running initialization");
                    pending.clone()
                }
                None => {
                    let pending = self.spawn_initialization(account_id, limit);
                    locks.insert(account_id.clone(), pending.clone());
                    pending
                }
            }
        };
        shared.await
    }

    fn spawn_initialization(&self, account_id: &AccountId, limit: usize) -> SharedInit {
        let manager = self.clone();
        let task_account = account_id.clone();

        let task = tokio::spawn(async move {
            let result = AssertUnwindSafe(manager.run_initialization(&task_account, limit))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ConnectionError::Generic("initialization panicked".to_string())));
            manager.inner.init_locks.lock().await.remove(&task_account);
            result
        });

        async move {
            task.await.unwrap_or_else(|err| {
                Err(ConnectionError::Generic(format!("initialization task failed: {err}")))
            })
        }
        .boxed()
        .shared()
    }

    async fn run_initialization(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<InitialSync, ConnectionError> {
        tracing::info!(account_id = %account_id, limit, "initializing account");
        self.stop(account_id).await;
        self.inner.registry.end(account_id).await;

        match self.load_initial(account_id, limit).await {
            Ok(sync) => {
                tracing::info!(
                    account_id = %account_id,
                    mailboxes = sync.mailbox_tree.len(),
                    emails = sync.initial_emails.len(),
                    "account initialized"
                );
                Ok(sync)
            }
            Err(err) => {
                tracing::warn!(account_id = %account_id, error = %err, "initialization failed");
                self.inner.registry.end(account_id).await;
                Err(err)
            }
        }
    }

    async fn load_initial(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<InitialSync, ConnectionError> {
        let session = self.connect(account_id).await?;
        let mailbox_tree = build_mailbox_tree(&session.list_mailboxes().await?);

        let lock = lock_inbox(&session).await?;
        let fetched = match SequenceRange::newest(lock.exists(), limit) {
            Some(range) => session.fetch_headers(lock.path(), range).await,
            None => Ok(Vec::new()),
        };
        lock.release().await;

        let mut initial_emails = fetched?;
        initial_emails.reverse();
        Ok(InitialSync {
            mailbox_tree,
            initial_emails,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::fakes::{password_account, Harness};
    use crate::ConnectionError;
    use imapviewer_core::AccountId;
    use std::time::Duration;

    fn id() -> AccountId {
        AccountId::from("a")
    }

    #[tokio::test]
    async fn concurrent_initializations_share_one_run() {
        let harness = Harness::new(vec![password_account("a")]);
        harness.connector.set_delay(Duration::from_millis(40));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let manager = harness.manager.clone();
            tasks.push(tokio::spawn(async move { manager.initialize(&id(), 3).await }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.expect("task joined").expect("initialized"));
        }

        assert_eq!(harness.connector.logins(), 1);
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        assert!(harness.manager.inner.init_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn newest_messages_come_first() {
        let harness = Harness::new(vec![password_account("a")]);
        let sync = harness.manager.initialize(&id(), 3).await.expect("initialized");

        let seqs: Vec<u32> = sync.initial_emails.iter().map(|header| header.seq).collect();
        assert_eq!(seqs, vec![10, 9, 8]);
        assert_eq!(sync.mailbox_tree[0].path, "INBOX");
        assert!(harness.connector.session(0).held_locks().is_empty());
    }

    #[tokio::test]
    async fn replaces_the_existing_session() {
        let harness = Harness::new(vec![password_account("a")]);
        harness.manager.watch(&id()).await.expect("watch");

        harness.manager.initialize(&id(), 5).await.expect("initialized");
        assert_eq!(harness.connector.logins(), 2);
        assert_eq!(harness.connector.session(0).logouts(), 1);
        assert!(!harness.manager.is_watching(&id()).await);
    }

    #[tokio::test]
    async fn failure_tears_down_the_partial_session() {
        let harness = Harness::new(vec![password_account("a")]);
        harness.connector.fail_fetches();

        let err = harness.manager.initialize(&id(), 5).await.err().expect("fetch fails");
        assert!(matches!(err, ConnectionError::Generic(_)));
        assert_eq!(harness.manager.connected_count().await, 0);
        assert_eq!(harness.connector.session(0).logouts(), 1);
        assert!(harness.manager.inner.init_locks.lock().await.is_empty());

        harness.manager.initialize(&id(), 5).await.err().expect("still failing");
        assert_eq!(harness.connector.logins(), 2);
    }
}
