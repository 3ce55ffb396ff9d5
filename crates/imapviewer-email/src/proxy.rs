use imapviewer_core::{ProxyConfig, ProxySource, ProxyUrl};
use std::sync::Arc;

/// Turns the global proxy setting into a connection-ready URL.
#[derive(Clone)]
pub struct ProxyResolver {
    source: Arc<dyn ProxySource>,
}

impl ProxyResolver {
    pub fn new(source: Arc<dyn ProxySource>) -> Self {
        Self { source }
    }

    /// `None` means connect directly.
    pub async fn resolve(&self) -> Option<ProxyUrl> {
        match self.source.global_proxy().await {
            Ok(Some(config)) => proxy_url(&config),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "proxy settings unavailable, connecting directly");
                None
            }
        }
    }
}

pub fn proxy_url(config: &ProxyConfig) -> Option<ProxyUrl> {
    if !config.enabled {
        return None;
    }

    let Some((host, port)) = config.endpoint() else {
        tracing::warn!(host_port = %config.host_port, "proxy enabled without a valid host:port, connecting directly");
        return None;
    };

    match ProxyUrl::new(
        config.kind,
        &host,
        port,
        config.username.as_deref(),
        config.password.as_deref(),
    ) {
        Ok(url) => Some(url),
        Err(err) => {
            tracing::warn!(error = %err, "proxy address rejected, connecting directly");
            None
        }
    }
}
