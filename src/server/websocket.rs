//! WebSocket server implementation
//!
//! Accepts TCP connections, runs the upgrade handshake with the path and origin gate,
//! and hands each upgraded socket to a new `Client`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tracing::{debug, error, info, warn};

use super::client::{Client, ClientConfig};
use super::keepalive::Keepalive;
use super::manager::ClientManager;
use super::router::Router;
use crate::config::RelayConfig;

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Path of the upgrade endpoint
    pub path: String,
    /// The one origin allowed to connect
    pub allowed_origin: String,
    /// Limits applied to every client
    pub client: ClientConfig,
}

impl ServerConfig {
    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl From<&RelayConfig> for ServerConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            bind: config.bind.clone(),
            port: config.port,
            path: config.path.clone(),
            allowed_origin: config.allowed_origin.clone(),
            client: ClientConfig {
                keepalive: Keepalive::new(config.pong_wait()),
                max_frame_size: config.max_frame_size,
                queue_capacity: config.outbound_queue_capacity,
            },
        }
    }
}

/// WebSocket server relaying chat events between clients
pub struct RelayServer {
    config: Arc<ServerConfig>,
    manager: Arc<ClientManager>,
    router: Arc<Router>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new server with the built-in event handlers
    pub fn new(config: ServerConfig) -> Self {
        Self::with_router(config, Router::with_default_handlers())
    }

    /// Create a new server with a custom router
    ///
    /// The router is frozen from here on; all handlers must already be registered.
    pub fn with_router(config: ServerConfig, router: Router) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            manager: Arc::new(ClientManager::new()),
            router: Arc::new(router),
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}{}", addr, self.config.path);

        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    ///
    /// Every connected client is closed before this returns, waiting up to one pong wait
    /// for their close frames to go out.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let config = Arc::clone(&self.config);
                            let manager = Arc::clone(&self.manager);
                            let router = Arc::clone(&self.router);

                            tokio::spawn(async move {
                                let result =
                                    handle_connection(stream, peer_addr, config, manager, router)
                                        .await;
                                if let Err(e) = result {
                                    warn!("Handshake with {} failed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let client_count = self.manager.client_count().await;
        if client_count > 0 {
            info!("Closing {} active clients...", client_count);
        }
        self.manager
            .close_all(self.config.client.keepalive.pong_wait())
            .await;

        Ok(())
    }
}

/// Upgrade one accepted stream and start its client
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    manager: Arc<ClientManager>,
    router: Arc<Router>,
) -> anyhow::Result<()> {
    debug!("New connection from {}", peer_addr);

    let gate = Arc::clone(&config);
    let callback = move |request: &Request, response: Response| {
        check_handshake(request, response, &gate.path, &gate.allowed_origin)
    };
    let socket =
        accept_hdr_async_with_config(stream, callback, Some(config.client.websocket_config()))
            .await?;

    let (client, egress) = Client::new(&manager, router, config.client, Some(peer_addr));
    info!("Client {} connected from {}", client.id(), peer_addr);

    manager.add(Arc::clone(&client)).await;
    client.start(socket, egress);

    Ok(())
}

/// Accept the upgrade only on the configured path and from the allowed origin
fn check_handshake(
    request: &Request,
    response: Response,
    path: &str,
    allowed_origin: &str,
) -> Result<Response, ErrorResponse> {
    if request.uri().path() != path {
        return Err(reject(StatusCode::NOT_FOUND, "Unknown endpoint"));
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if origin != Some(allowed_origin) {
        warn!("Rejected connection from origin {:?}", origin);
        return Err(reject(StatusCode::FORBIDDEN, "Origin not allowed"));
    }

    Ok(response)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
