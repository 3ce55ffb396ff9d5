use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Account, AccountId, ProxyConfig};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("settings unavailable: {0}")]
    Unavailable(String),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Read access to the configured accounts.
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn accounts(&self) -> Result<Vec<Account>, SourceError>;

    async fn account(&self, id: &AccountId) -> Result<Option<Account>, SourceError> {
        Ok(self
            .accounts()
            .await?
            .into_iter()
            .find(|account| &account.id == id))
    }
}

/// Read access to the global proxy setting.
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn global_proxy(&self) -> Result<Option<ProxyConfig>, SourceError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryAccounts {
    accounts: Vec<Account>,
}

impl MemoryAccounts {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl AccountSource for MemoryAccounts {
    async fn accounts(&self) -> Result<Vec<Account>, SourceError> {
        Ok(self.accounts.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticProxy(pub Option<ProxyConfig>);

#[async_trait]
impl ProxySource for StaticProxy {
    async fn global_proxy(&self) -> Result<Option<ProxyConfig>, SourceError> {
        Ok(self.0.clone())
    }
}
