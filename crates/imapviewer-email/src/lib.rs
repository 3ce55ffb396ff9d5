mod error;
#[cfg(test)]
mod fakes;
mod imap;
mod initializer;
mod notifier;
mod operations;
mod orchestrator;
mod proxy;
mod registry;
mod session;
mod tree;
mod watcher;

pub use error::ConnectionError;
pub use imap::{ImapConnector, ImapSession};
pub use notifier::{ChannelNotifier, Notifier, NotifierEvent, TracingNotifier};
pub use orchestrator::{ConnectionManager, ManagerSettings};
pub use proxy::{proxy_url, ProxyResolver};
pub use registry::ConnectionRegistry;
pub use session::{
    ConnectRequest, ConnectTimeouts, Credentials, MailConnector, MailSession, MailboxLock,
    SequenceRange, SessionEvent, SessionHandle,
};
pub use tree::build_mailbox_tree;
