//! Core server: accepts WebSocket connections and hands each one to the
//! registry.

use crate::config::ServerConfig;
use crate::registry::RegistryHandle;
use crate::transport::websocket::{self, WebSocketConnection};
use plexus_core::{PlexusError, PlexusResult};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The plexus server instance.
pub struct PlexusServer {
    registry: RegistryHandle,
    local_addr: SocketAddr,
    connections: mpsc::Receiver<WebSocketConnection>,
}

impl PlexusServer {
    /// Bind the listener. Connections queue until [`run`](Self::run).
    pub async fn bind(config: &ServerConfig, registry: RegistryHandle) -> PlexusResult<Self> {
        let (local_addr, connections) =
            websocket::start_listener(config.bind_addr, config.path_prefix.clone()).await?;
        Ok(Self {
            registry,
            local_addr,
            connections,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve connections until the registry stops.
    pub async fn run(mut self) -> PlexusResult<()> {
        info!(addr = %self.local_addr, "server running");

        while let Some(conn) = self.connections.recv().await {
            if self.registry.is_closed() {
                info!("registry stopped, no longer accepting");
                break;
            }
            tokio::spawn(serve(self.registry.clone(), conn));
        }
        Ok(())
    }
}

async fn serve(registry: RegistryHandle, conn: WebSocketConnection) {
    let remote = conn.meta.remote_addr;
    let path = conn.meta.path.clone();

    match registry.accept_connection(conn.transport, conn.meta).await {
        Ok(id) => debug!(client = %id, remote = ?remote, "connection finished"),
        Err(PlexusError::ConnectionRejected(reason)) => {
            info!(remote = ?remote, path = %path, reason = %reason, "connection rejected");
        }
        Err(e) => warn!(remote = ?remote, path = %path, error = %e, "connection failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::ChatApp;
    use crate::config::{ConfigOverrides, ServerConfig};
    use crate::registry::Registry;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    async fn chat_server() -> (SocketAddr, RegistryHandle) {
        let overrides = ConfigOverrides {
            bind: Some("127.0.0.1".into()),
            port: Some(0),
            path: Some("/chat".into()),
            ..Default::default()
        };
        let config = ServerConfig::load(None, &overrides).unwrap();
        let (handle, _task) = Registry::spawn(ChatApp::new(), config.registry.clone());
        let server = PlexusServer::bind(&config, handle.clone()).await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run());
        (addr, handle)
    }

    async fn wait_established(handle: &RegistryHandle, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.clients().await.unwrap().len() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn chat_over_websocket() {
        let (addr, handle) = chat_server().await;
        let (mut alice, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/chat/alice"))
            .await
            .unwrap();
        let (mut bob, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/chat/bob"))
            .await
            .unwrap();
        wait_established(&handle, 2).await;

        alice
            .send(Message::Text(r#"{"type":"say","data":"hello"}"#.into()))
            .await
            .unwrap();

        for client in [&mut alice, &mut bob] {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let got: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            assert_eq!(got["type"], "message");
            assert_eq!(got["data"], "alice: hello");
        }

        bob.close(None).await.unwrap();
        wait_established(&handle, 1).await;
        assert_eq!(handle.clients().await.unwrap(), vec![plexus_core::ClientId::from("alice")]);
    }

    #[tokio::test]
    async fn declined_identity_closes_the_socket() {
        let (addr, handle) = chat_server().await;
        let (mut anon, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/chat/"))
            .await
            .unwrap();

        // The server closes without ever establishing a session.
        let next = tokio::time::timeout(Duration::from_secs(5), anon.next())
            .await
            .unwrap();
        assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
        assert_eq!(handle.stats().await.unwrap().rejected, 1);
    }
}
