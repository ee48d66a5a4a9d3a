//! The application capability injected into the registry.

use crate::router::Router;
use plexus_core::{ClientId, Envelope};
use std::net::SocketAddr;

/// What the transport layer knows about a connection before it has an
/// identity.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    /// Remote socket address, when the transport has one.
    pub remote_addr: Option<SocketAddr>,
    /// Request path of the upgrade request (e.g. `/chat/alice`).
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    /// Upgrade request headers.
    pub headers: Vec<(String, String)>,
}

impl ConnectionMeta {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_remote(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// The part of the path after the last `/`. Empty for `/chat/`.
    pub fn last_path_segment(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[idx + 1..],
            None => &self.path,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value of a query parameter (no percent-decoding).
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (k == name).then_some(v)
        })
    }
}

/// Application-side callbacks.
///
/// Every method runs on the registry task, one call at a time, so an
/// implementation can keep plain mutable state. Callbacks must not block:
/// anything slow belongs in a separate task that talks back through a
/// [`RegistryHandle`](crate::registry::RegistryHandle).
pub trait Handler: Send + 'static {
    /// Choose an identity for a new connection. `None` (or an empty id)
    /// declines it; the transport is closed and no other callback fires
    /// for that connection.
    fn assign_identity(&mut self, meta: &ConnectionMeta) -> Option<ClientId>;

    /// The session is established and routable.
    fn on_connect(&mut self, _id: &ClientId, _router: &mut Router<'_>) {}

    /// A message arrived from an established session. `msg.from` is
    /// always the sender's identity.
    fn on_message(&mut self, msg: Envelope, router: &mut Router<'_>);

    /// An established session closed. Called exactly once per session
    /// that reached `on_connect`.
    fn on_disconnect(&mut self, id: &ClientId, router: &mut Router<'_>);
}
