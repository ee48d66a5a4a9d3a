//! Multi-user chat room.
//!
//! Clients connect to `<prefix>/<name>` and are known by `<name>`. Every
//! text a member sends is relayed to all members as
//! `{"type": "message", "from": <name>, "data": "<name>: <text>"}`.

use crate::handler::{ConnectionMeta, Handler};
use crate::router::Router;
use plexus_core::{ClientId, Envelope};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ChatApp {
    members: BTreeSet<ClientId>,
}

impl ChatApp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members(&self) -> impl Iterator<Item = &ClientId> {
        self.members.iter()
    }
}

impl Handler for ChatApp {
    fn assign_identity(&mut self, meta: &ConnectionMeta) -> Option<ClientId> {
        let name = meta.last_path_segment();
        if name.is_empty() {
            return None;
        }
        Some(ClientId::from(name))
    }

    fn on_connect(&mut self, id: &ClientId, _router: &mut Router<'_>) {
        self.members.insert(id.clone());
    }

    fn on_message(&mut self, msg: Envelope, router: &mut Router<'_>) {
        let Some(from) = msg.from else {
            return;
        };
        let Some(text) = msg.data.as_str() else {
            debug!(client = %from, kind = %msg.kind, "ignoring non-text chat message");
            return;
        };

        let line = Envelope::new("message", format!("{from}: {text}")).with_from(from.clone());
        for member in &self.members {
            router.send(member, line.clone());
        }
    }

    fn on_disconnect(&mut self, id: &ClientId, _router: &mut Router<'_>) {
        self.members.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registry, RegistryConfig};
    use plexus_core::{MemoryPeer, MemoryTransport, WireFormat};
    use serde_json::json;
    use std::time::Duration;

    async fn join(
        handle: &crate::registry::RegistryHandle,
        path: &str,
    ) -> (tokio::task::JoinHandle<plexus_core::PlexusResult<ClientId>>, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair(16);
        let handle = handle.clone();
        let meta = ConnectionMeta::new(path);
        let task = tokio::spawn(async move { handle.accept_connection(transport, meta).await });
        (task, peer)
    }

    async fn next_json(peer: &mut MemoryPeer) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), peer.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(frame.as_bytes()).unwrap()
    }

    async fn wait_established(handle: &crate::registry::RegistryHandle, n: usize) {
        while handle.clients().await.unwrap().len() != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn identity_is_the_last_path_segment() {
        let mut app = ChatApp::new();
        assert_eq!(
            app.assign_identity(&ConnectionMeta::new("/chat/alice")),
            Some(ClientId::from("alice"))
        );
        assert_eq!(app.assign_identity(&ConnectionMeta::new("/chat/")), None);
    }

    #[tokio::test]
    async fn text_is_relayed_to_every_member() {
        let (handle, _task) = Registry::spawn(ChatApp::new(), RegistryConfig::default());
        let (_a, mut alice) = join(&handle, "/chat/alice").await;
        let (_b, mut bob) = join(&handle, "/chat/bob").await;
        tokio::time::timeout(Duration::from_secs(5), wait_established(&handle, 2))
            .await
            .unwrap();

        let said = json!({"type": "say", "data": "hi all"}).to_string();
        alice.send(plexus_core::Frame::Text(said)).await.unwrap();

        for peer in [&mut alice, &mut bob] {
            let got = next_json(peer).await;
            assert_eq!(got["type"], "message");
            assert_eq!(got["from"], "alice");
            assert_eq!(got["data"], "alice: hi all");
        }
    }

    #[tokio::test]
    async fn non_text_payloads_are_ignored() {
        let (handle, _task) = Registry::spawn(ChatApp::new(), RegistryConfig::default());
        let (_a, mut alice) = join(&handle, "/chat/alice").await;
        tokio::time::timeout(Duration::from_secs(5), wait_established(&handle, 1))
            .await
            .unwrap();

        let env = Envelope::new("say", json!({"nested": true}));
        alice.send(WireFormat::Json.encode(&env).unwrap()).await.unwrap();
        let env = Envelope::new("say", "after");
        alice.send(WireFormat::Json.encode(&env).unwrap()).await.unwrap();

        // Only the text message comes back.
        assert_eq!(next_json(&mut alice).await["data"], "alice: after");
    }

    #[tokio::test]
    async fn departed_members_stop_receiving() {
        let (handle, _task) = Registry::spawn(ChatApp::new(), RegistryConfig::default());
        let (_a, mut alice) = join(&handle, "/chat/alice").await;
        let (bob_task, mut bob) = join(&handle, "/chat/bob").await;
        tokio::time::timeout(Duration::from_secs(5), wait_established(&handle, 2))
            .await
            .unwrap();

        bob.close();
        bob_task.await.unwrap().unwrap();
        wait_established(&handle, 1).await;

        let env = Envelope::new("say", "anyone?");
        alice.send(WireFormat::Json.encode(&env).unwrap()).await.unwrap();
        assert_eq!(next_json(&mut alice).await["data"], "alice: anyone?");
        assert!(bob.recv().await.is_none());
        assert_eq!(handle.stats().await.unwrap().routing_misses, 0);
    }
}
