//! plexus-server: session registry and WebSocket server.
//!
//! The [`Registry`] owns every established session and routes messages
//! between them on behalf of an application [`Handler`]. Transports plug in
//! through [`plexus_core::Transport`]; the bundled listener speaks
//! WebSocket.

pub mod apps;
pub mod config;
pub mod handler;
pub mod pump;
pub mod registry;
pub mod router;
pub mod server;
mod session;
pub mod transport;

pub use config::{ConfigOverrides, ServerConfig};
pub use handler::{ConnectionMeta, Handler};
pub use registry::{DuplicateIdentity, Registry, RegistryConfig, RegistryHandle, RegistryStats};
pub use router::Router;
pub use server::PlexusServer;
pub use session::{Delivery, Phase};
