use crate::{AppConfig, ConfigError};
use async_trait::async_trait;
use directories::ProjectDirs;
use imapviewer_core::{Account, AccountSource, ProxyConfig, ProxySource, SourceError};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const ORG: &str = "io";
const AUTHOR: &str = "IMAPViewer";
const APP: &str = "IMAPViewer";

#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from(ORG, AUTHOR, APP).ok_or(ConfigError::MissingDirectories)?;
        Self::with_path(dirs.config_dir().join("config.toml"))
    }

    /// Uses an explicit config file, writing defaults when it does not exist yet.
    pub fn with_path(config_path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let config_path = config_path.into();
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if !config_path.exists() {
            let initial = AppConfig::default();
            let content = toml::to_string_pretty(&initial)?;
            fs::write(&config_path, content)?;
            tracing::info!(path = %config_path.display(), "wrote default configuration");
        }

        Ok(Self { config_path })
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let content = fs::read_to_string(&self.config_path)?;
        let config: AppConfig = toml::from_str(&content)?;

        let mut seen = HashSet::new();
        for account in &config.accounts {
            if !seen.insert(account.id.clone()) {
                return Err(ConfigError::DuplicateAccount(account.id.to_string()));
            }
        }

        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

fn source_error(err: ConfigError) -> SourceError {
    match err {
        ConfigError::TomlDe(_) | ConfigError::DuplicateAccount(_) => {
            SourceError::Invalid(err.to_string())
        }
        other => SourceError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl AccountSource for ConfigManager {
    async fn accounts(&self) -> Result<Vec<Account>, SourceError> {
        self.load()
            .map(|config| config.accounts)
            .map_err(source_error)
    }
}

#[async_trait]
impl ProxySource for ConfigManager {
    async fn global_proxy(&self) -> Result<Option<ProxyConfig>, SourceError> {
        self.load()
            .map(|config| Some(config.proxy))
            .map_err(source_error)
    }
}
