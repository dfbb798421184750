//! Client connection
//!
//! One `Client` per accepted socket. The socket is split in two: a read loop that
//! decodes inbound frames and hands them to the router, and a write loop that is the
//! only writer on the socket. Everything that wants to reach the peer goes through the
//! bounded outbound queue drained by the write loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, protocol::WebSocketConfig, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::keepalive::Keepalive;
use super::manager::ClientManager;
use super::protocol::{Event, ProtocolError};
use super::router::Router;

/// Default limit for a single inbound frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512;

/// Default capacity of a client's outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Errors that can occur on a client connection
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("No pong received within {0:?}")]
    PongTimeout(Duration),

    #[error("Peer did not accept a frame within {0:?}")]
    WriteTimeout(Duration),

    #[error("Outbound queue is closed")]
    QueueClosed,

    #[error("Outbound queue is full")]
    QueueFull,
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Lifecycle of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, loops not started yet
    Connecting,
    /// Both loops running
    Active,
    /// Teardown requested, loops winding down
    Closing,
    /// Both loops exited and the client is out of the registry
    Closed,
}

impl ClientState {
    pub fn is_closing(self) -> bool {
        matches!(self, ClientState::Closing | ClientState::Closed)
    }
}

/// Per-connection limits and timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub keepalive: Keepalive,
    pub max_frame_size: usize,
    pub queue_capacity: usize,
}

impl ClientConfig {
    /// Transport settings enforcing the inbound frame limit
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_frame_size);
        config.max_frame_size = Some(self.max_frame_size);
        config
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keepalive: Keepalive::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Receiving end of a client's outbound queue, owned by its write loop
pub type EventQueue = mpsc::Receiver<Event>;

/// A single live client session
pub struct Client {
    id: Uuid,
    peer_addr: Option<SocketAddr>,
    config: ClientConfig,
    /// Sender half of the outbound queue; `None` once the queue is closed
    egress: Mutex<Option<mpsc::Sender<Event>>>,
    state: watch::Sender<ClientState>,
    /// Loops still running; the last one to exit marks the client closed
    live_loops: AtomicUsize,
    manager: Weak<ClientManager>,
    router: Arc<Router>,
}

impl Client {
    /// Create a client bound to the given registry and router
    ///
    /// Returns the client and the receiving end of its outbound queue, which must be
    /// handed to [`Client::start`] (or [`Client::write_loop`]).
    pub fn new(
        manager: &Arc<ClientManager>,
        router: Arc<Router>,
        config: ClientConfig,
        peer_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, EventQueue) {
        let (egress_tx, egress_rx) = mpsc::channel(config.queue_capacity);
        let (state, _) = watch::channel(ClientState::Connecting);

        let client = Arc::new(Self {
            id: Uuid::new_v4(),
            peer_addr,
            config,
            egress: Mutex::new(Some(egress_tx)),
            state,
            live_loops: AtomicUsize::new(2),
            manager: Arc::downgrade(manager),
            router,
        });

        (client, egress_rx)
    }

    /// Get the client ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Wait until both loops have exited
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        wait_until(&mut state, |state| state == ClientState::Closed).await;
    }

    /// The registry this client belongs to, if it still exists
    pub fn manager(&self) -> Option<Arc<ClientManager>> {
        self.manager.upgrade()
    }

    /// Split the socket and spawn the read and write loops
    pub fn start<S>(
        self: &Arc<Self>,
        socket: WebSocketStream<S>,
        egress: EventQueue,
    ) -> (JoinHandle<()>, JoinHandle<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();

        self.state.send_if_modified(|state| {
            if *state == ClientState::Connecting {
                *state = ClientState::Active;
                true
            } else {
                false
            }
        });

        let reader = tokio::spawn(Arc::clone(self).read_loop(stream));
        let writer = tokio::spawn(Arc::clone(self).write_loop(sink, egress));
        (reader, writer)
    }

    /// Hand an event to the write loop without waiting
    pub fn enqueue(&self, event: Event) -> ClientResult<()> {
        let egress = self.egress.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = egress.as_ref().ok_or(ClientError::QueueClosed)?;

        sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => ClientError::QueueFull,
            TrySendError::Closed(_) => ClientError::QueueClosed,
        })
    }

    /// Close the outbound queue and stop the read loop
    ///
    /// The write loop drains what is already queued, sends a close frame and exits.
    /// Returns `false` if the client was already closing.
    pub fn close(&self) -> bool {
        let sender = self
            .egress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        self.state.send_if_modified(|state| {
            if state.is_closing() {
                false
            } else {
                *state = ClientState::Closing;
                true
            }
        })
    }

    /// Read frames until the socket fails, the peer goes quiet, or the client closes
    ///
    /// Always removes the client from the registry on exit.
    pub async fn read_loop<S>(self: Arc<Self>, mut stream: S)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        match self.read_messages(&mut stream).await {
            Ok(()) => debug!("Client {} read loop finished", self.id),
            Err(ClientError::WebSocket(e)) if is_disconnect(&e) => {
                debug!("Client {} disconnected: {}", self.id, e);
            }
            Err(e) => warn!("Client {} read loop terminated: {}", self.id, e),
        }

        self.finish_loop().await;
    }

    async fn read_messages<S>(&self, stream: &mut S) -> ClientResult<()>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let mut deadline = self.config.keepalive.read_deadline();
        let mut state = self.state.subscribe();

        loop {
            let frame = tokio::select! {
                _ = wait_until(&mut state, ClientState::is_closing) => {
                    debug!("Client {} closing, read loop stopping", self.id);
                    return Ok(());
                }
                frame = tokio::time::timeout_at(deadline.expires_at(), stream.next()) => frame,
            };

            let message = match frame {
                Err(_) => {
                    return Err(ClientError::PongTimeout(self.config.keepalive.pong_wait()));
                }
                Ok(None) => {
                    info!("Connection closed by client {}", self.id);
                    return Ok(());
                }
                Ok(Some(result)) => result?,
            };

            match message {
                Message::Text(text) => {
                    self.check_frame_size(text.len())?;
                    let event = Event::from_json(&text).inspect_err(|_| {
                        debug!("Client {} sent undecodable frame: {}", self.id, text);
                    })?;
                    self.route(event).await;
                }
                Message::Binary(data) => {
                    self.check_frame_size(data.len())?;
                    let event = Event::from_slice(&data)?;
                    self.route(event).await;
                }
                Message::Pong(_) => {
                    debug!("Client {} pong", self.id);
                    deadline.refresh();
                }
                Message::Ping(_) => {
                    // tungstenite queues the pong reply itself
                    debug!("Client {} ping", self.id);
                }
                Message::Close(frame) => {
                    info!("Client {} requested close: {:?}", self.id, frame);
                    return Ok(());
                }
                Message::Frame(_) => {}
            }
        }
    }

    fn check_frame_size(&self, size: usize) -> ClientResult<()> {
        if size > self.config.max_frame_size {
            return Err(ClientError::FrameTooLarge {
                size,
                limit: self.config.max_frame_size,
            });
        }
        Ok(())
    }

    async fn route(&self, event: Event) {
        debug!("Client {} sent {} event", self.id, event.event_type);

        if let Err(e) = self.router.dispatch(&event, self).await {
            warn!(
                "Client {} error handling {} event: {}",
                self.id, event.event_type, e
            );
        }
    }

    /// Drain the outbound queue onto the socket and send keepalive pings
    ///
    /// The only writer on the socket. A frame the peer does not accept within the pong
    /// wait ends the loop. Always removes the client from the registry on exit.
    pub async fn write_loop<K>(self: Arc<Self>, mut sink: K, mut egress: EventQueue)
    where
        K: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        match self.write_messages(&mut sink, &mut egress).await {
            Ok(()) => debug!("Client {} write loop finished", self.id),
            Err(ClientError::WebSocket(e)) if is_disconnect(&e) => {
                debug!("Client {} connection already closed: {}", self.id, e);
            }
            Err(e) => warn!("Client {} write loop terminated: {}", self.id, e),
        }

        egress.close();
        self.finish_loop().await;
    }

    async fn write_messages<K>(&self, sink: &mut K, egress: &mut EventQueue) -> ClientResult<()>
    where
        K: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let mut ticker = self.config.keepalive.ping_ticker();

        loop {
            tokio::select! {
                event = egress.recv() => {
                    let Some(event) = event else {
                        debug!("Client {} queue closed, sending close frame", self.id);
                        self.send_frame(sink, Message::Close(None)).await?;
                        return Ok(());
                    };

                    match event.to_json() {
                        Ok(text) => {
                            self.send_frame(sink, Message::Text(text)).await?;
                            debug!("Client {} sent {} event", self.id, event.event_type);
                        }
                        Err(e) => {
                            warn!(
                                "Client {} failed to encode {} event: {}",
                                self.id, event.event_type, e
                            );
                        }
                    }
                }
                _ = ticker.tick() => {
                    debug!("Client {} ping", self.id);
                    self.send_frame(sink, Message::Ping(Vec::new())).await?;
                }
            }
        }
    }

    async fn send_frame<K>(&self, sink: &mut K, message: Message) -> ClientResult<()>
    where
        K: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let write_wait = self.config.keepalive.pong_wait();
        tokio::time::timeout(write_wait, sink.send(message))
            .await
            .map_err(|_| ClientError::WriteTimeout(write_wait))??;
        Ok(())
    }

    async fn finish_loop(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self).await;
        }
        // Covers clients that were never registered
        self.close();

        if self.live_loops.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.send_replace(ClientState::Closed);
            match self.peer_addr {
                Some(addr) => info!("Client {} ({}) closed", self.id, addr),
                None => info!("Client {} closed", self.id),
            }
        }
    }
}

/// Resolves once the watched state satisfies `done`
async fn wait_until<F>(state: &mut watch::Receiver<ClientState>, done: F)
where
    F: Fn(ClientState) -> bool,
{
    loop {
        if done(*state.borrow_and_update()) {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Errors that just mean the peer went away
fn is_disconnect(error: &tungstenite::Error) -> bool {
    matches!(
        error,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(
                tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
                    | tungstenite::error::ProtocolError::SendAfterClosing
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::protocol::{ChatBroadcast, EVENT_NEW_MESSAGE, EVENT_SEND_MESSAGE};
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;

    type Peer = WebSocketStream<DuplexStream>;

    const WAIT: Duration = Duration::from_secs(3);

    fn test_config(pong_wait: Duration) -> ClientConfig {
        ClientConfig {
            keepalive: Keepalive::new(pong_wait),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            queue_capacity: 16,
        }
    }

    async fn connect(manager: &Arc<ClientManager>, config: ClientConfig) -> (Arc<Client>, Peer) {
        connect_buffered(manager, config, 64 * 1024).await
    }

    /// Register and start a client over an in-memory socket, returning the peer end
    async fn connect_buffered(
        manager: &Arc<ClientManager>,
        config: ClientConfig,
        buffer: usize,
    ) -> (Arc<Client>, Peer) {
        let (server_io, peer_io) = tokio::io::duplex(buffer);
        let transport = Some(config.websocket_config());
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, transport).await;
        let peer = WebSocketStream::from_raw_socket(peer_io, Role::Client, None).await;

        let router = Arc::new(Router::with_default_handlers());
        let (client, egress) = Client::new(manager, router, config, None);
        manager.add(Arc::clone(&client)).await;
        client.start(server, egress);

        (client, peer)
    }

    async fn next_text(peer: &mut Peer) -> String {
        loop {
            let message = timeout(WAIT, peer.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = message {
                return text;
            }
        }
    }

    async fn wait_closed(client: &Client) {
        timeout(WAIT, client.closed())
            .await
            .expect("timed out waiting for close");
        assert_eq!(client.state(), ClientState::Closed);
    }

    fn chat(from: &str, message: &str) -> String {
        json!({
            "type": EVENT_SEND_MESSAGE,
            "payload": { "from": from, "message": message },
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_new_client_is_connecting() {
        let manager = Arc::new(ClientManager::new());
        let (client, _egress) = Client::new(
            &manager,
            Arc::new(Router::new()),
            ClientConfig::default(),
            None,
        );
        assert_eq!(client.state(), ClientState::Connecting);
        assert!(client.manager().is_some());
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let manager = Arc::new(ClientManager::new());
        let (client, _egress) = Client::new(
            &manager,
            Arc::new(Router::new()),
            ClientConfig::default(),
            None,
        );

        assert!(client.close());
        assert!(!client.close());
        assert_eq!(client.state(), ClientState::Closing);

        let event = Event::new(EVENT_NEW_MESSAGE, &json!({})).unwrap();
        assert!(matches!(client.enqueue(event), Err(ClientError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_enqueue_full_queue() {
        let manager = Arc::new(ClientManager::new());
        let config = ClientConfig {
            queue_capacity: 1,
            ..ClientConfig::default()
        };
        let (client, _egress) = Client::new(&manager, Arc::new(Router::new()), config, None);

        let event = Event::new(EVENT_NEW_MESSAGE, &json!({})).unwrap();
        client.enqueue(event.clone()).unwrap();
        assert!(matches!(client.enqueue(event), Err(ClientError::QueueFull)));
    }

    #[tokio::test]
    async fn test_outbound_order_preserved() {
        let manager = Arc::new(ClientManager::new());
        let (client, mut peer) = connect(&manager, test_config(Duration::from_secs(10))).await;
        assert_eq!(client.state(), ClientState::Active);

        for seq in 0..5 {
            let event = Event::new(EVENT_NEW_MESSAGE, &json!({ "seq": seq })).unwrap();
            client.enqueue(event).unwrap();
        }

        for seq in 0..5 {
            let event = Event::from_json(&next_text(&mut peer).await).unwrap();
            assert_eq!(event.payload["seq"], seq);
        }
    }

    #[tokio::test]
    async fn test_close_drains_queue_then_sends_close_frame() {
        let manager = Arc::new(ClientManager::new());
        let (client, mut peer) = connect(&manager, test_config(Duration::from_secs(10))).await;

        let event = Event::new(EVENT_NEW_MESSAGE, &json!({ "last": true })).unwrap();
        client.enqueue(event).unwrap();
        assert!(manager.remove(&client).await);

        let text = next_text(&mut peer).await;
        assert!(text.contains("last"));

        let message = timeout(WAIT, peer.next()).await.unwrap().unwrap().unwrap();
        assert!(matches!(message, Message::Close(_)));

        wait_closed(&client).await;
        assert_eq!(manager.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_chat_message_echoed_to_sender() {
        let manager = Arc::new(ClientManager::new());
        let (_client, mut peer) = connect(&manager, test_config(Duration::from_secs(10))).await;

        peer.send(Message::Text(chat("ada", "hello"))).await.unwrap();

        let event = Event::from_json(&next_text(&mut peer).await).unwrap();
        assert_eq!(event.event_type, EVENT_NEW_MESSAGE);
        let broadcast: ChatBroadcast = event.decode_payload().unwrap();
        assert_eq!(broadcast.from, "ada");
        assert_eq!(broadcast.message, "hello");
    }

    #[tokio::test]
    async fn test_unknown_event_type_keeps_connection_open() {
        let manager = Arc::new(ClientManager::new());
        let (client, mut peer) = connect(&manager, test_config(Duration::from_secs(10))).await;

        let unknown = json!({ "type": "join_room", "payload": {} }).to_string();
        peer.send(Message::Text(unknown)).await.unwrap();
        peer.send(Message::Text(chat("ada", "still here"))).await.unwrap();

        let event = Event::from_json(&next_text(&mut peer).await).unwrap();
        assert_eq!(event.payload["message"], "still here");
        assert_eq!(client.state(), ClientState::Active);
        assert!(manager.contains(client.id()).await);
    }

    #[tokio::test]
    async fn test_malformed_payload_keeps_connection_open() {
        let manager = Arc::new(ClientManager::new());
        let (client, mut peer) = connect(&manager, test_config(Duration::from_secs(10))).await;

        let bad = json!({ "type": EVENT_SEND_MESSAGE, "payload": { "from": 3 } }).to_string();
        peer.send(Message::Text(bad)).await.unwrap();
        peer.send(Message::Text(chat("ada", "after"))).await.unwrap();

        let event = Event::from_json(&next_text(&mut peer).await).unwrap();
        assert_eq!(event.payload["message"], "after");
        assert_eq!(client.state(), ClientState::Active);
    }

    #[tokio::test]
    async fn test_undecodable_frame_terminates_connection() {
        let manager = Arc::new(ClientManager::new());
        let (client, mut peer) = connect(&manager, test_config(Duration::from_secs(10))).await;

        peer.send(Message::Text("not json".to_string())).await.unwrap();

        wait_closed(&client).await;
        assert!(!manager.contains(client.id()).await);
    }

    #[tokio::test]
    async fn test_oversize_frame_terminates_only_sender() {
        let manager = Arc::new(ClientManager::new());
        let config = test_config(Duration::from_secs(10));
        let (offender, mut offender_peer) = connect(&manager, config).await;
        let (bystander, mut bystander_peer) = connect(&manager, config).await;
        assert_eq!(manager.client_count().await, 2);

        let oversized = chat("ada", &"x".repeat(DEFAULT_MAX_FRAME_SIZE * 2));
        offender_peer.send(Message::Text(oversized)).await.unwrap();

        wait_closed(&offender).await;
        assert_eq!(manager.client_count().await, 1);
        assert!(manager.contains(bystander.id()).await);

        bystander_peer
            .send(Message::Text(chat("bob", "unaffected")))
            .await
            .unwrap();
        let event = Event::from_json(&next_text(&mut bystander_peer).await).unwrap();
        assert_eq!(event.payload["from"], "bob");
        assert_eq!(bystander.state(), ClientState::Active);
    }

    #[tokio::test]
    async fn test_peer_close_removes_client() {
        let manager = Arc::new(ClientManager::new());
        let (client, mut peer) = connect(&manager, test_config(Duration::from_secs(10))).await;

        peer.close(None).await.unwrap();

        wait_closed(&client).await;
        assert_eq!(manager.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_silent_peer_is_reaped() {
        let manager = Arc::new(ClientManager::new());
        // The peer never reads, so it never answers pings
        let (client, _peer) = connect(&manager, test_config(Duration::from_millis(200))).await;

        wait_closed(&client).await;
        assert_eq!(manager.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_stalled_peer_releases_socket() {
        let manager = Arc::new(ClientManager::new());
        // A tiny transport buffer the peer never drains, so writes stall
        let config = test_config(Duration::from_millis(300));
        let (client, _peer) = connect_buffered(&manager, config, 256).await;

        for seq in 0..8 {
            let payload = json!({ "seq": seq, "body": "x".repeat(100) });
            let event = Event::new(EVENT_NEW_MESSAGE, &payload).unwrap();
            client.enqueue(event).unwrap();
        }

        wait_closed(&client).await;
        assert!(!manager.contains(client.id()).await);
    }

    #[tokio::test]
    async fn test_responsive_peer_is_not_reaped() {
        let manager = Arc::new(ClientManager::new());
        let (client, mut peer) = connect(&manager, test_config(Duration::from_secs(1))).await;

        // Reading lets tungstenite answer each ping with a pong
        let reader = tokio::spawn(async move {
            let mut pings = 0;
            while let Some(Ok(message)) = peer.next().await {
                if matches!(message, Message::Ping(_)) {
                    pings += 1;
                }
            }
            pings
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(client.state(), ClientState::Active);
        assert!(manager.contains(client.id()).await);

        manager.remove(&client).await;
        let pings = timeout(WAIT, reader).await.unwrap().unwrap();
        assert!(pings >= 2, "expected several pings, got {}", pings);
    }
}
