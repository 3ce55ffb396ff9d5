mod host;

use anyhow::Context;
use clap::{Parser, Subcommand};
use host::Host;
use imapviewer_config::ConfigManager;
use imapviewer_core::{AccountId, AuthConfig};
use imapviewer_security::{OAuthProfile, ReauthWorkflow};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about = "Connect to IMAP accounts and watch them for new mail")]
struct Cli {
    /// Config file, defaults to the platform config directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured accounts
    Accounts,
    /// Open a session and print the mailbox tree
    Connect { account: String },
    /// Fresh session, folder tree and newest inbox headers as JSON
    Init {
        account: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Report new inbox mail until interrupted
    Watch { account: String },
    /// Sign an OAuth2 account in again
    Reauth { account: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    }
    .context("initialize config manager")?;

    match cli.command {
        Command::Accounts => list_accounts(&config_manager),
        Command::Reauth { account } => reauth(&config_manager, &AccountId::new(account)).await,
        command => {
            let host = Host::initialize(config_manager)?;
            let result = run(&host, command).await;
            host.manager.end_all().await;
            result
        }
    }
}

fn list_accounts(config_manager: &ConfigManager) -> anyhow::Result<()> {
    let config = config_manager.load().context("load app config")?;
    if config.accounts.is_empty() {
        println!("No accounts in {}", config_manager.config_path().display());
    }
    for account in &config.accounts {
        let auth = match account.auth {
            AuthConfig::Password { .. } => "password",
            AuthConfig::OAuth2 { .. } => "oauth2",
        };
        println!(
            "{}\t{}\t{}:{}\t{auth}",
            account.id, account.email, account.incoming.host, account.incoming.port
        );
    }
    Ok(())
}

async fn run(host: &Host, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Connect { account } => {
            let account_id = AccountId::new(account);
            host.manager
                .connect(&account_id)
                .await
                .with_context(|| format!("connect {account_id}"))?;
            let tree = host.manager.list_mailboxes(&account_id).await;
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
        Command::Init { account, limit } => {
            let account_id = AccountId::new(account);
            let limit = limit.unwrap_or(host.config.sync.initial_email_limit);
            let sync = host
                .manager
                .initialize(&account_id, limit)
                .await
                .with_context(|| format!("initialize {account_id}"))?;
            println!("{}", serde_json::to_string_pretty(&sync)?);
        }
        Command::Watch { account } => {
            let account_id = AccountId::new(account);
            host.manager
                .watch(&account_id)
                .await
                .with_context(|| format!("watch {account_id}"))?;
            tracing::info!(account_id = %account_id, "watching, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
            host.manager.stop(&account_id).await;
        }
        Command::Accounts | Command::Reauth { .. } => {}
    }
    Ok(())
}

async fn reauth(config_manager: &ConfigManager, account_id: &AccountId) -> anyhow::Result<()> {
    let config = config_manager.load().context("load app config")?;
    let account = config
        .accounts
        .iter()
        .find(|account| &account.id == account_id)
        .with_context(|| format!("account {account_id} not configured"))?;
    let AuthConfig::OAuth2 { client_id, .. } = &account.auth else {
        anyhow::bail!("account {account_id} does not use OAuth2");
    };

    let workflow = ReauthWorkflow::new(OAuthProfile {
        client_id: client_id.clone(),
        auth_url: config.oauth.auth_url.clone(),
        token_url: config.oauth.token_url.clone(),
        redirect_url: config.oauth.redirect_url.clone(),
        scopes: config.oauth.scopes.clone(),
    })?;
    let session = workflow.begin(&account.email)?;

    println!("Open this URL and sign in:\n\n{}\n", session.authorization_url);
    println!("Paste the address the browser was redirected to:");
    let redirected = BufReader::new(tokio::io::stdin())
        .lines()
        .next_line()
        .await?
        .context("no redirect address entered")?;
    let (code, state) = authorization_response(&redirected)?;

    let token = workflow.complete(&session, &state, &code).await?;
    let expires_at = chrono::Utc::now()
        + chrono::Duration::seconds(token.expires_in_secs.unwrap_or(3600) as i64);
    host::store_token(
        config_manager,
        account_id,
        &token.access_token,
        token.refresh_token.as_deref(),
        expires_at,
    )?;
    println!("Signed in again as {}", account.email);
    Ok(())
}

/// `code` and `state` from the redirect the authorization server sent the browser to.
fn authorization_response(redirected: &str) -> anyhow::Result<(String, String)> {
    let url = Url::parse(redirected.trim()).context("parse redirect address")?;
    let param = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    };

    if let Some(error) = param("error") {
        anyhow::bail!(
            "authorization failed: {error} {}",
            param("error_description").unwrap_or_default()
        );
    }
    let code = param("code").context("redirect has no code")?;
    let state = param("state").context("redirect has no state")?;
    Ok((code, state))
}
