pub mod ledger_client;
pub mod watcher;

pub use ledger_client::LedgerClient;
pub use watcher::Watcher;
