//! WebSocket server module
//!
//! Handles client connections, routes their events to handlers, and fans
//! broadcasts out to every connected client.

mod client;
mod handler;
mod keepalive;
mod manager;
mod protocol;
mod router;
mod websocket;

pub use websocket::{RelayServer, ServerConfig};
