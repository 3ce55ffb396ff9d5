mod connect;
mod parse;
mod session;

pub use connect::ImapConnector;
pub use session::ImapSession;
