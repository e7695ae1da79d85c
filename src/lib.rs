pub mod config;
pub mod context;
pub mod directory;
pub mod dispatcher;
pub mod domain_utils;
pub mod mlmmj;
pub mod plugins;
pub mod server;
pub mod spf;
pub mod trusted;
pub mod verdict;

pub use config::Config;
pub use context::{ProtocolState, TransactionContext};
pub use dispatcher::Dispatcher;
pub use server::PolicyServer;
pub use verdict::{RejectKind, Verdict};
