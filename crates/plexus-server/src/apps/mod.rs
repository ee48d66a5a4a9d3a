//! Bundled applications served by the `plexus-server` binary.

pub mod chat;
pub mod ticker;

pub use chat::ChatApp;
pub use ticker::{spawn_ticker, TickerApp};
