mod model;
mod source;

pub use model::*;
pub use source::{AccountSource, MemoryAccounts, ProxySource, SourceError, StaticProxy};
