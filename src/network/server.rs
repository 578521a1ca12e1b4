//! pvAccess server
//!
//! The server accepts connections, runs the validation handshake, and hosts
//! the channels clients create on each connection. Every connection is served
//! by one [`ServerConnection`], which owns its transport and dispatches the
//! frames read from it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::{
    accept_handshake, lock, FrameHandler, Framed, NetworkConfig, Role, Transport,
    TransportClient, TransportError, TransportEvent,
};
use crate::handlers::{Dispatcher, PutGetRequest};
use crate::protocol::{Encoder, Frame, ServerValidation};
use crate::provider::{Channel, ChannelProvider};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Transport(#[from] TransportError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client completed the handshake
    ClientConnected { addr: SocketAddr, priority: i16 },
    /// A client connection closed
    ClientDisconnected { addr: SocketAddr, forced: bool },
    /// Server started
    Started { bind_addr: SocketAddr },
    /// Server stopped
    Stopped,
    /// Error occurred
    Error { message: String },
}

/// A channel created by a client on one connection
pub struct ServerChannel {
    cid: u32,
    sid: u32,
    name: String,
    channel: Arc<dyn Channel>,
    requests: Mutex<HashMap<u32, Arc<PutGetRequest>>>,
}

impl ServerChannel {
    pub fn new(cid: u32, sid: u32, name: String, channel: Arc<dyn Channel>) -> Self {
        Self {
            cid,
            sid,
            name,
            channel,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The provider's channel
    pub fn backend(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Register an operation; false if the ioid is already live
    pub fn register(&self, ioid: u32, request: Arc<PutGetRequest>) -> bool {
        let mut requests = lock(&self.requests);
        if requests.contains_key(&ioid) {
            return false;
        }
        requests.insert(ioid, request);
        true
    }

    pub fn request(&self, ioid: u32) -> Option<Arc<PutGetRequest>> {
        lock(&self.requests).get(&ioid).cloned()
    }

    pub(crate) fn unregister(&self, ioid: u32) {
        lock(&self.requests).remove(&ioid);
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Destroy every operation, then the provider's channel
    pub fn destroy(&self) {
        let requests: Vec<Arc<PutGetRequest>> =
            lock(&self.requests).drain().map(|(_, r)| r).collect();
        for request in requests {
            request.destroy();
        }
        self.channel.destroy();
        tracing::debug!("Channel '{}' (sid {}) destroyed", self.name, self.sid);
    }
}

#[derive(Default)]
struct ChannelTable {
    closed: bool,
    by_sid: HashMap<u32, Arc<ServerChannel>>,
}

/// Server half of one client connection
pub struct ServerConnection {
    me: Weak<ServerConnection>,
    id: u32,
    transport: Arc<Transport>,
    provider: Arc<dyn ChannelProvider>,
    dispatcher: Arc<Dispatcher>,
    channels: Mutex<ChannelTable>,
    next_sid: AtomicU32,
}

impl ServerConnection {
    pub fn new(
        transport: Arc<Transport>,
        provider: Arc<dyn ChannelProvider>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: 1,
            transport,
            provider,
            dispatcher,
            channels: Mutex::new(ChannelTable::default()),
            next_sid: AtomicU32::new(1),
        })
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.transport.remote_addr()
    }

    pub fn provider(&self) -> &Arc<dyn ChannelProvider> {
        &self.provider
    }

    pub fn channel(&self, sid: u32) -> Option<Arc<ServerChannel>> {
        lock(&self.channels).by_sid.get(&sid).cloned()
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).by_sid.len()
    }

    /// Host a provider channel; `None` once the connection was torn down
    pub fn register_channel(
        &self,
        cid: u32,
        name: String,
        channel: Arc<dyn Channel>,
    ) -> Option<u32> {
        let mut table = lock(&self.channels);
        if table.closed {
            drop(table);
            channel.destroy();
            return None;
        }
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "Channel '{}' created for {} (cid {}, sid {})",
            name,
            self.transport.remote_addr(),
            cid,
            sid
        );
        table
            .by_sid
            .insert(sid, Arc::new(ServerChannel::new(cid, sid, name, channel)));
        Some(sid)
    }

    /// Destroy one channel; false if the sid is unknown
    pub fn destroy_channel(&self, sid: u32) -> bool {
        let removed = lock(&self.channels).by_sid.remove(&sid);
        match removed {
            Some(channel) => {
                channel.destroy();
                true
            }
            None => false,
        }
    }

    fn teardown(&self) {
        let channels: Vec<Arc<ServerChannel>> = {
            let mut table = lock(&self.channels);
            table.closed = true;
            table.by_sid.drain().map(|(_, c)| c).collect()
        };
        if !channels.is_empty() {
            tracing::debug!(
                "Destroying {} channel(s) of {}",
                channels.len(),
                self.transport.remote_addr()
            );
        }
        for channel in channels {
            channel.destroy();
        }
    }

    /// Destroy all channels and release the connection
    pub fn shutdown(&self) {
        self.teardown();
        self.transport.release(self);
    }
}

impl TransportClient for ServerConnection {
    fn client_id(&self) -> u32 {
        self.id
    }

    fn transport_closed(&self) {
        self.teardown();
    }
}

impl FrameHandler for ServerConnection {
    fn handle_frame(&self, _transport: &Arc<Transport>, frame: Frame) {
        if let Some(me) = self.me.upgrade() {
            self.dispatcher.dispatch(&me, frame);
        }
    }
}

/// State shared by the accept loop and the per-client tasks
struct Shared {
    config: NetworkConfig,
    provider: Arc<dyn ChannelProvider>,
    dispatcher: Arc<Dispatcher>,
    guid: Uuid,
    connections: RwLock<HashMap<SocketAddr, Arc<ServerConnection>>>,
    event_tx: mpsc::Sender<ServerEvent>,
}

/// pvAccess server
pub struct Server {
    shared: Arc<Shared>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a new server serving channels from `provider`
    pub fn new(config: NetworkConfig, provider: Arc<dyn ChannelProvider>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            shared: Arc::new(Shared {
                config,
                provider,
                dispatcher: Arc::new(Dispatcher::server()),
                guid: Uuid::new_v4(),
                connections: RwLock::new(HashMap::new()),
                event_tx,
            }),
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// GUID sent to clients during the handshake
    pub fn guid(&self) -> Uuid {
        self.shared.guid
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start the server
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let config = &self.shared.config;
        let bind_addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {} (guid {})", local_addr, self.shared.guid);
        self.local_addr = Some(local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let _ = self
            .shared
            .event_tx
            .send(ServerEvent::Started {
                bind_addr: local_addr,
            })
            .await;

        let shared = self.shared.clone();
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);

                                let shared = shared.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_client(stream, addr, shared.clone()).await {
                                        tracing::error!("Client {} handler error: {}", addr, e);
                                        let _ = shared.event_tx.send(ServerEvent::Error {
                                            message: format!("{}: {}", addr, e),
                                        }).await;
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            let _ = shared.event_tx.send(ServerEvent::Stopped).await;
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every connection
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        let connections: Vec<Arc<ServerConnection>> =
            self.shared.connections.read().await.values().cloned().collect();
        for connection in connections {
            connection.shutdown();
        }

        Ok(())
    }

    /// Addresses of connected clients
    pub async fn connections(&self) -> Vec<SocketAddr> {
        let connections = self.shared.connections.read().await;
        connections.keys().copied().collect()
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Handshake with a client, then serve it until the connection closes
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let config = &shared.config;
    let mut framed = Framed::new(stream, Encoder::server(), config.max_message_size);

    let local = ServerValidation {
        receive_buffer_size: config.receive_buffer_size,
        registry_max_size: config.registry_max_size,
        server_guid: shared.guid,
    };
    let answer = tokio::time::timeout(
        config.connect_timeout(),
        accept_handshake(&mut framed, &local),
    )
    .await
    .map_err(|_| TransportError::Timeout)??;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let transport = Transport::new(
        addr,
        Role::Server,
        answer.priority,
        config.transport_options(),
        Some(events_tx),
    );
    transport.registry().limit_max_size(answer.registry_max_size);

    let connection = ServerConnection::new(
        transport.clone(),
        shared.provider.clone(),
        shared.dispatcher.clone(),
    );
    transport.acquire(connection.clone());
    shared
        .connections
        .write()
        .await
        .insert(addr, connection.clone());
    transport.start(framed, connection.clone());

    let _ = shared
        .event_tx
        .send(ServerEvent::ClientConnected {
            addr,
            priority: answer.priority,
        })
        .await;

    let mut forced = true;
    while let Some(event) = events_rx.recv().await {
        if let TransportEvent::Closed { forced: f } = event {
            forced = f;
            break;
        }
    }

    shared.connections.write().await.remove(&addr);
    tracing::info!("Client {} disconnected", addr);
    let _ = shared
        .event_tx
        .send(ServerEvent::ClientDisconnected { addr, forced })
        .await;

    Ok(())
}
