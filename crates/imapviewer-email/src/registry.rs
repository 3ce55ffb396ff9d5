use crate::session::{same_session, SessionHandle};
use futures::future::join_all;
use imapviewer_core::AccountId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Live sessions keyed by account. At most one per account.
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<AccountId, SessionHandle>>,
    logout_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LOGOUT_TIMEOUT)
    }
}

impl ConnectionRegistry {
    pub fn new(logout_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            logout_timeout,
        }
    }

    /// Registered session if still usable. Stale entries are evicted.
    pub async fn get(&self, account_id: &AccountId) -> Option<SessionHandle> {
        match self.lookup(account_id).await {
            Ok(session) => Some(session),
            Err(Some(stale)) => {
                self.retire(account_id, stale).await;
                None
            }
            Err(None) => None,
        }
    }

    /// Like [`get`](Self::get) without I/O: a stale entry is removed and handed
    /// back for the caller to retire.
    pub(crate) async fn lookup(
        &self,
        account_id: &AccountId,
    ) -> Result<SessionHandle, Option<SessionHandle>> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(account_id) {
            Some(session) if session.is_usable() => Ok(session.clone()),
            Some(_) => {
                tracing::debug!(account_id = %account_id, "evicting unusable session");
                Err(sessions.remove(account_id))
            }
            None => Err(None),
        }
    }

    /// Swaps in `session` without I/O and hands back the one it displaced.
    pub(crate) async fn install(
        &self,
        account_id: &AccountId,
        session: SessionHandle,
    ) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        match sessions.insert(account_id.clone(), session.clone()) {
            Some(previous) if !same_session(&previous, &session) => Some(previous),
            _ => None,
        }
    }

    pub async fn set(&self, account_id: &AccountId, session: SessionHandle) {
        if let Some(previous) = self.install(account_id, session).await {
            tracing::info!(account_id = %account_id, "replacing registered session");
            self.retire(account_id, previous).await;
        }
    }

    /// Idempotent teardown of the account's session.
    pub async fn end(&self, account_id: &AccountId) {
        let removed = self.sessions.lock().await.remove(account_id);
        if let Some(session) = removed {
            self.retire(account_id, session).await;
        }
    }

    pub async fn end_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        tracing::info!(sessions = drained.len(), "closing all sessions");
        join_all(
            drained
                .into_iter()
                .map(|(account_id, session)| async move { self.retire(&account_id, session).await }),
        )
        .await;
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Graceful logout when possible, forced close otherwise. Never fails.
    pub(crate) async fn retire(&self, account_id: &AccountId, session: SessionHandle) {
        if !session.is_usable() {
            session.close().await;
            return;
        }

        match tokio::time::timeout(self.logout_timeout, session.logout()).await {
            Ok(Ok(())) => {
                tracing::debug!(account_id = %account_id, "session logged out");
            }
            Ok(Err(err)) => {
                tracing::warn!(account_id = %account_id, error = %err, "logout failed, closing");
                session.close().await;
            }
            Err(_) => {
                tracing::warn!(account_id = %account_id, "logout timed out, closing");
                session.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeSession;
    use std::sync::Arc;

    fn id() -> AccountId {
        AccountId::from("acct")
    }

    #[tokio::test]
    async fn get_evicts_unusable_sessions() {
        let registry = ConnectionRegistry::default();
        let session = FakeSession::new(5);
        registry.set(&id(), session.clone()).await;
        assert!(registry.get(&id()).await.is_some());

        session.break_connection();
        assert!(registry.get(&id()).await.is_none());
        assert!(registry.is_empty().await);
        assert_eq!(session.closes(), 1);
    }

    #[tokio::test]
    async fn set_logs_out_the_displaced_session() {
        let registry = ConnectionRegistry::default();
        let first = FakeSession::new(1);
        let second = FakeSession::new(1);

        registry.set(&id(), first.clone()).await;
        registry.set(&id(), first.clone()).await;
        assert_eq!(first.logouts(), 0);

        registry.set(&id(), second.clone()).await;
        assert_eq!(first.logouts(), 1);
        let current = registry.get(&id()).await.expect("session registered");
        let expected: SessionHandle = second.clone();
        assert!(same_session(&current, &expected));
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let session = FakeSession::new(1);
        registry.set(&id(), session.clone()).await;

        registry.end(&id()).await;
        registry.end(&id()).await;
        assert_eq!(session.logouts(), 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn failed_logout_falls_back_to_close() {
        let registry = ConnectionRegistry::default();
        let session = FakeSession::new(1);
        session.fail_logout();
        registry.set(&id(), session.clone()).await;

        registry.end(&id()).await;
        assert_eq!(session.logouts(), 1);
        assert_eq!(session.closes(), 1);
    }

    #[tokio::test]
    async fn end_all_tolerates_failures() {
        let registry = ConnectionRegistry::default();
        let sessions: Vec<Arc<FakeSession>> = (0..4).map(|_| FakeSession::new(1)).collect();
        for (index, session) in sessions.iter().enumerate() {
            if index % 2 == 0 {
                session.fail_logout();
            }
            registry
                .set(&AccountId::new(format!("acct-{index}")), session.clone())
                .await;
        }

        registry.end_all().await;
        assert!(registry.is_empty().await);
        assert_eq!(sessions.iter().map(|s| s.logouts()).sum::<usize>(), 4);
        assert_eq!(sessions.iter().map(|s| s.closes()).sum::<usize>(), 2);
    }
}
