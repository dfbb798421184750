//! Client manager
//!
//! Maintains the registry of live clients and fans events out to them.
//! Membership changes take the write lock; broadcasts take the read lock and only ever
//! hand events to client queues without waiting, so no lock is held across socket I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::{Client, ClientError, ClientState};
use super::protocol::Event;

/// Registry of all live clients
pub struct ClientManager {
    clients: RwLock<HashMap<Uuid, Arc<Client>>>,
}

impl ClientManager {
    /// Create an empty client manager
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Add a client to the registry
    pub async fn add(&self, client: Arc<Client>) {
        let id = client.id();
        let mut clients = self.clients.write().await;
        clients.insert(id, client);
        info!("Client {} added ({} connected)", id, clients.len());
    }

    /// Close a client and remove it from the registry
    ///
    /// Removing a client that is not registered is a no-op. Returns whether the client
    /// was present.
    pub async fn remove(&self, client: &Client) -> bool {
        let mut clients = self.clients.write().await;

        match clients.remove(&client.id()) {
            Some(removed) => {
                removed.close();
                info!("Client {} removed ({} connected)", client.id(), clients.len());
                true
            }
            None => false,
        }
    }

    /// Queue an event for every registered client
    ///
    /// Returns the number of clients that accepted the event. A client whose queue is
    /// full or already closed is skipped.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let clients = self.clients.read().await;
        let mut delivered = 0;

        for client in clients.values() {
            match client.enqueue(event.clone()) {
                Ok(()) => delivered += 1,
                Err(ClientError::QueueFull) => {
                    warn!(
                        "Client {} outbound queue full, dropping {} event",
                        client.id(),
                        event.event_type
                    );
                }
                Err(e) => debug!("Skipping client {}: {}", client.id(), e),
            }
        }

        delivered
    }

    /// Get the number of registered clients
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Check if a client is registered
    #[cfg(test)]
    pub async fn contains(&self, id: Uuid) -> bool {
        self.clients.read().await.contains_key(&id)
    }

    /// Close and remove every client. Used during server shutdown.
    ///
    /// Waits up to `grace` for every client to flush its queue, send its close frame
    /// and stop both loops.
    pub async fn close_all(&self, grace: Duration) {
        let clients: Vec<Arc<Client>> = {
            let mut clients = self.clients.write().await;
            clients.drain().map(|(_, client)| client).collect()
        };

        if clients.is_empty() {
            return;
        }

        for client in &clients {
            client.close();
        }

        let all_closed = future::join_all(clients.iter().map(|client| client.closed()));
        if tokio::time::timeout(grace, all_closed).await.is_err() {
            let pending = clients
                .iter()
                .filter(|client| client.state() != ClientState::Closed)
                .count();
            warn!("{} clients did not close within {:?}", pending, grace);
        }
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}
