use crate::orchestrator::ConnectionManager;
use crate::session::SequenceRange;
use crate::tree::build_mailbox_tree;
use crate::ConnectionError;
use imapviewer_core::{AccountId, LogLevel, MailHeader, MailboxEntry, MailboxNode, MessageBody};

// These never fail outward: errors are logged and reported through the notifier.
impl ConnectionManager {
    pub async fn list_mailboxes(&self, account_id: &AccountId) -> Vec<MailboxNode> {
        match self.try_list_mailboxes(account_id).await {
            Ok(entries) => build_mailbox_tree(&entries),
            Err(err) => {
                self.report_failure(account_id, "listing mailboxes", &err);
                Vec::new()
            }
        }
    }

    /// Newest `limit` headers of `path`, newest first.
    pub async fn fetch_headers(
        &self,
        account_id: &AccountId,
        path: &str,
        limit: usize,
    ) -> Vec<MailHeader> {
        match self.try_fetch_headers(account_id, path, limit).await {
            Ok(mut headers) => {
                headers.reverse();
                headers
            }
            Err(err) => {
                self.report_failure(account_id, "fetching headers", &err);
                Vec::new()
            }
        }
    }

    async fn try_fetch_headers(
        &self,
        account_id: &AccountId,
        path: &str,
        limit: usize,
    ) -> Result<Vec<MailHeader>, ConnectionError> {
        let session = self.connect(account_id).await?;
        let lock = session.lock_mailbox(path).await?;
        let fetched = match SequenceRange::newest(lock.exists(), limit) {
            Some(range) => session.fetch_headers(path, range).await,
            None => Ok(Vec::new()),
        };
        lock.release().await;
        fetched
    }

    pub async fn fetch_body(
        &self,
        account_id: &AccountId,
        path: &str,
        uid: u32,
    ) -> Option<MessageBody> {
        match self.try_fetch_body(account_id, path, uid).await {
            Ok(body) => {
                if body.is_none() {
                    tracing::debug!(account_id = %account_id, mailbox = path, uid, "message not found");
                }
                body
            }
            Err(err) => {
                self.report_failure(account_id, "fetching message", &err);
                None
            }
        }
    }

    async fn try_list_mailboxes(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<MailboxEntry>, ConnectionError> {
        let session = self.connect(account_id).await?;
        session.list_mailboxes().await
    }

    async fn try_fetch_body(
        &self,
        account_id: &AccountId,
        path: &str,
        uid: u32,
    ) -> Result<Option<MessageBody>, ConnectionError> {
        let session = self.connect(account_id).await?;
        let lock = session.lock_mailbox(path).await?;
        let body = session.fetch_body(path, uid).await;
        lock.release().await;
        body
    }

    fn report_failure(&self, account_id: &AccountId, action: &str, err: &ConnectionError) {
        tracing::warn!(account_id = %account_id, error = %err, "{action} failed");
        self.inner
            .notifier
            .on_log(account_id, LogLevel::Warn, &format!("{action} failed: {err}"));
    }
}
