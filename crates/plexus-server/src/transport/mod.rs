//! Network transports for the server.

pub mod websocket;

pub use websocket::{start_listener, WebSocketConnection, WebSocketTransport};
