//! pvAccess client
//!
//! A [`ClientContext`] keeps one connection per (server address, priority).
//! Channels are the owners of that connection: the first channel opens it,
//! destroying the last one closes it. Replies are decoded on the reader task
//! and handed to the waiting call.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{
    connect_handshake, lock, FrameHandler, Framed, NetworkConfig, Role, SendControl, Transport,
    TransportClient, TransportError, TransportSender,
};
use crate::protocol::{
    get_u32, get_u8, write_string, ClientValidation, CodecError, Command, Encoder, Frame, Phase,
    RequestFlags, ServerValidation, Status,
};
use crate::provider::FieldData;
use crate::pvdata::{deserialize_changed, serialize_changed, BitSet, PvStructure, Structure};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("Request failed: {0}")]
    Failed(Status),

    #[error("Operation already destroyed")]
    Destroyed,

    #[error("Unexpected reply: {0}")]
    Unexpected(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Opens channels on servers, sharing connections
pub struct ClientContext {
    config: NetworkConfig,
    connections: tokio::sync::Mutex<HashMap<(SocketAddr, i16), Arc<ClientConnection>>>,
    next_cid: AtomicU32,
}

impl ClientContext {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            connections: tokio::sync::Mutex::new(HashMap::new()),
            next_cid: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Open connections, excluding closed ones
    pub async fn connection_count(&self) -> usize {
        let connections = self.connections.lock().await;
        connections
            .values()
            .filter(|c| !c.transport.is_closed())
            .count()
    }

    /// Create a channel on the server at `addr`
    pub async fn create_channel(&self, addr: SocketAddr, name: &str) -> ClientResult<ClientChannel> {
        let cid = self.next_cid.fetch_add(1, Ordering::SeqCst);
        let inner = {
            let mut connections = self.connections.lock().await;
            let key = (addr, self.config.priority);
            let connection = match connections.get(&key) {
                Some(existing) if !existing.transport.is_closed() => existing.clone(),
                _ => {
                    let connection = ClientConnection::connect(addr, &self.config).await?;
                    connections.insert(key, connection.clone());
                    connection
                }
            };
            let inner = Arc::new(ChannelInner {
                cid,
                sid: AtomicU32::new(0),
                name: name.to_string(),
                connection: connection.clone(),
                destroyed: AtomicBool::new(false),
            });
            if !connection.transport.acquire(inner.clone()) {
                return Err(ClientError::Closed);
            }
            inner
        };

        match inner.connection.create_channel(cid, name).await {
            Ok(sid) => {
                inner.sid.store(sid, Ordering::SeqCst);
                tracing::debug!("Channel '{}' connected (cid {}, sid {})", name, cid, sid);
                Ok(ClientChannel { inner })
            }
            Err(e) => {
                inner.destroyed.store(true, Ordering::SeqCst);
                inner.connection.transport.release(inner.as_ref());
                Err(e)
            }
        }
    }
}

/// Reply to a put-get message, decoded on the reader task
enum Reply {
    Types {
        put: Option<Arc<Structure>>,
        get: Option<Arc<Structure>>,
    },
    Data(FieldData),
    Empty,
}

struct PendingChannel {
    reply: oneshot::Sender<ClientResult<u32>>,
}

struct PendingRequest {
    /// Shape of the data the reply carries
    shape: Option<Arc<Structure>>,
    reply: oneshot::Sender<ClientResult<Reply>>,
}

/// Client half of one connection
pub struct ClientConnection {
    transport: Arc<Transport>,
    server_guid: Mutex<Uuid>,
    next_ioid: AtomicU32,
    pending_channels: Mutex<HashMap<u32, PendingChannel>>,
    pending_requests: Mutex<HashMap<u32, PendingRequest>>,
}

impl ClientConnection {
    /// Connect, validate, and start the transport
    async fn connect(addr: SocketAddr, config: &NetworkConfig) -> ClientResult<Arc<Self>> {
        tracing::info!("Connecting to {}...", addr);
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;

        let mut framed = Framed::new(stream, Encoder::client(), config.max_message_size);
        let local = ClientValidation {
            receive_buffer_size: config.receive_buffer_size,
            registry_max_size: config.registry_max_size,
            priority: config.priority,
        };
        let announcement = tokio::time::timeout(
            config.connect_timeout(),
            connect_handshake(&mut framed, &local),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;

        let transport = Transport::new(
            addr,
            Role::Client,
            config.priority,
            config.transport_options(),
            None,
        );
        transport
            .registry()
            .limit_max_size(announcement.registry_max_size);

        let connection = Arc::new(Self {
            transport: transport.clone(),
            server_guid: Mutex::new(announcement.server_guid),
            next_ioid: AtomicU32::new(1),
            pending_channels: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
        });
        transport.start(framed, connection.clone());
        Ok(connection)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn server_guid(&self) -> Uuid {
        *lock(&self.server_guid)
    }

    async fn create_channel(&self, cid: u32, name: &str) -> ClientResult<u32> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_channels).insert(cid, PendingChannel { reply: tx });

        let name = name.to_string();
        let queued = self.transport.enqueue_send_nowait(
            move |control: &mut SendControl<'_>| -> Result<(), CodecError> {
                control.start_message(Command::CreateChannel)?;
                let buf = control.buffer();
                buf.put_u32(cid);
                write_string(buf, &name);
                control.flush();
                Ok(())
            },
        );
        if let Err(e) = queued {
            lock(&self.pending_channels).remove(&cid);
            return Err(e.into());
        }
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Queue a put-get message and wait for the matching reply
    async fn request<S>(&self, ioid: u32, shape: Option<Arc<Structure>>, sender: S) -> ClientResult<Reply>
    where
        S: TransportSender + 'static,
    {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_requests).insert(ioid, PendingRequest { shape, reply: tx });
        if let Err(e) = self.transport.enqueue_send_nowait(sender) {
            lock(&self.pending_requests).remove(&ioid);
            return Err(e.into());
        }
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Wake every waiter with a closed error
    fn fail_pending(&self) {
        let channels = std::mem::take(&mut *lock(&self.pending_channels));
        let requests = std::mem::take(&mut *lock(&self.pending_requests));
        for (_, pending) in channels {
            let _ = pending.reply.send(Err(ClientError::Closed));
        }
        for (_, pending) in requests {
            let _ = pending.reply.send(Err(ClientError::Closed));
        }
    }

    fn on_validation(&self, transport: &Transport, payload: Bytes) -> ClientResult<()> {
        let announcement = ServerValidation::decode(payload)?;
        let changed = {
            let mut guid = lock(&self.server_guid);
            let changed = *guid != announcement.server_guid;
            *guid = announcement.server_guid;
            changed
        };
        if changed {
            tracing::info!(
                "Server {} restarted (guid {})",
                transport.remote_addr(),
                announcement.server_guid
            );
            transport.changed_transport();
        }
        Ok(())
    }

    fn on_channel_reply(&self, mut payload: Bytes) -> ClientResult<()> {
        let cid = get_u32(&mut payload)?;
        let sid = get_u32(&mut payload)?;
        let status = Status::deserialize(&mut payload)?;
        let Some(pending) = lock(&self.pending_channels).remove(&cid) else {
            tracing::debug!("Channel reply for unknown cid {}", cid);
            return Ok(());
        };
        let result = if status.is_success() {
            Ok(sid)
        } else {
            Err(ClientError::Failed(status))
        };
        let _ = pending.reply.send(result);
        Ok(())
    }

    fn on_put_get_reply(&self, transport: &Transport, mut payload: Bytes) -> ClientResult<()> {
        let ioid = get_u32(&mut payload)?;
        let flags = RequestFlags::decode(get_u8(&mut payload)?);
        let status = Status::deserialize(&mut payload)?;
        let pending = lock(&self.pending_requests).remove(&ioid);
        let shape = pending.as_ref().and_then(|p| p.shape.clone());

        // Descriptors are decoded even without a waiter to keep the type cache in step
        let result = decode_reply(transport, flags, status, shape, &mut payload);
        match pending {
            Some(pending) => {
                let _ = pending.reply.send(result);
            }
            None => tracing::debug!("Put-get reply for unknown ioid {}", ioid),
        }
        Ok(())
    }
}

fn decode_reply(
    transport: &Transport,
    flags: RequestFlags,
    status: Status,
    shape: Option<Arc<Structure>>,
    payload: &mut Bytes,
) -> ClientResult<Reply> {
    if !status.is_success() {
        return Err(ClientError::Failed(status));
    }
    if flags.phase == Phase::Init {
        let mut registry = transport.registry();
        let put = registry.deserialize_structure(payload)?;
        let get = registry.deserialize_structure(payload)?;
        return Ok(Reply::Types { put, get });
    }
    match shape {
        Some(shape) if payload.has_remaining() => {
            let mut value = PvStructure::new(shape);
            let changed = deserialize_changed(&mut value, payload)?;
            Ok(Reply::Data(FieldData { value, changed }))
        }
        _ => Ok(Reply::Empty),
    }
}

impl FrameHandler for ClientConnection {
    fn handle_frame(&self, transport: &Arc<Transport>, frame: Frame) {
        let command = match frame.command() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Ignoring message from {}: {}", transport.remote_addr(), e);
                return;
            }
        };
        let result = match command {
            Command::Echo => Ok(()),
            Command::ConnectionValidation => self.on_validation(transport, frame.payload),
            Command::CreateChannel => self.on_channel_reply(frame.payload),
            Command::PutGet => self.on_put_get_reply(transport, frame.payload),
            other => {
                tracing::debug!("No handler for {} from {}", other, transport.remote_addr());
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!("{} from {} failed: {}", command, transport.remote_addr(), e);
        }
    }
}

struct ChannelInner {
    cid: u32,
    sid: AtomicU32,
    name: String,
    connection: Arc<ClientConnection>,
    destroyed: AtomicBool,
}

impl TransportClient for ChannelInner {
    fn client_id(&self) -> u32 {
        self.cid
    }

    fn transport_closed(&self) {
        tracing::info!("Channel '{}' disconnected", self.name);
        self.connection.fail_pending();
    }

    fn transport_unresponsive(&self) {
        tracing::warn!("Channel '{}' server is unresponsive", self.name);
    }

    fn transport_responsive(&self) {
        tracing::info!("Channel '{}' server is responsive again", self.name);
    }
}

/// A channel on a server; holds its connection open
pub struct ClientChannel {
    inner: Arc<ChannelInner>,
}

impl ClientChannel {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn cid(&self) -> u32 {
        self.inner.cid
    }

    pub fn sid(&self) -> u32 {
        self.inner.sid.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.inner.connection.transport
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.destroyed.load(Ordering::SeqCst) && !self.transport().is_closed()
    }

    /// Create a put-get operation with the given request descriptor
    pub async fn create_put_get(&self, request: &PvStructure) -> ClientResult<ClientPutGet> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(ClientError::Destroyed);
        }
        let connection = &self.inner.connection;
        let ioid = connection.next_ioid.fetch_add(1, Ordering::SeqCst);
        let sid = self.sid();
        let request = request.clone();
        let reply = connection
            .request(
                ioid,
                None,
                move |control: &mut SendControl<'_>| -> Result<(), CodecError> {
                    control.start_message(Command::PutGet)?;
                    let buf = control.buffer();
                    buf.put_u32(sid);
                    buf.put_u32(ioid);
                    buf.put_u8(RequestFlags::new(Phase::Init).encode());
                    control.serialize_structure(Some(request.structure()));
                    request.serialize(control.buffer())?;
                    control.flush();
                    Ok(())
                },
            )
            .await?;
        match reply {
            Reply::Types { put, get } => Ok(ClientPutGet {
                channel: self.inner.clone(),
                ioid,
                put_structure: put,
                get_structure: get,
                last: false,
                destroyed: false,
            }),
            _ => Err(ClientError::Unexpected("put-get init without types".into())),
        }
    }

    /// Destroy the channel on the server and release the connection
    pub async fn destroy(self) -> ClientResult<()> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sid = self.sid();
        let cid = self.cid();
        let transport = self.transport().clone();
        let result = transport
            .enqueue_send(move |control: &mut SendControl<'_>| -> Result<(), CodecError> {
                control.start_message(Command::DestroyChannel)?;
                let buf = control.buffer();
                buf.put_u32(sid);
                buf.put_u32(cid);
                control.flush();
                Ok(())
            })
            .await;
        transport.release(self.inner.as_ref());
        result.map_err(ClientError::from)
    }
}

/// Client side of one put-get operation
pub struct ClientPutGet {
    channel: Arc<ChannelInner>,
    ioid: u32,
    put_structure: Option<Arc<Structure>>,
    get_structure: Option<Arc<Structure>>,
    last: bool,
    destroyed: bool,
}

impl ClientPutGet {
    pub fn ioid(&self) -> u32 {
        self.ioid
    }

    pub fn put_structure(&self) -> Option<&Arc<Structure>> {
        self.put_structure.as_ref()
    }

    pub fn get_structure(&self) -> Option<&Arc<Structure>> {
        self.get_structure.as_ref()
    }

    /// An empty value of the put shape
    pub fn create_put(&self) -> Option<PvStructure> {
        self.put_structure.clone().map(PvStructure::new)
    }

    /// The next phase destroys the operation after its reply
    pub fn set_last_request(&mut self) {
        self.last = true;
    }

    /// Read the get side
    pub async fn get(&mut self) -> ClientResult<FieldData> {
        let shape = self.get_structure.clone();
        self.phase(Phase::Get, shape, None).await
    }

    /// Read back the put side
    pub async fn get_put(&mut self) -> ClientResult<FieldData> {
        let shape = self.put_structure.clone();
        self.phase(Phase::GetPut, shape, None).await
    }

    /// Write the fields of `value` selected by `changed`, then read the get side
    pub async fn put_get(&mut self, value: &PvStructure, changed: &BitSet) -> ClientResult<FieldData> {
        let mut body = BytesMut::new();
        serialize_changed(value, changed, &mut body)?;
        let shape = self.get_structure.clone();
        self.phase(Phase::PutGet, shape, Some(body.freeze())).await
    }

    async fn phase(
        &mut self,
        phase: Phase,
        shape: Option<Arc<Structure>>,
        body: Option<Bytes>,
    ) -> ClientResult<FieldData> {
        if self.destroyed {
            return Err(ClientError::Destroyed);
        }
        let flags = RequestFlags {
            phase,
            last: self.last,
        };
        if self.last {
            self.destroyed = true;
        }

        let sid = self.channel.sid.load(Ordering::SeqCst);
        let ioid = self.ioid;
        let reply = self
            .channel
            .connection
            .request(
                ioid,
                shape,
                move |control: &mut SendControl<'_>| -> Result<(), CodecError> {
                    control.start_message(Command::PutGet)?;
                    let buf = control.buffer();
                    buf.put_u32(sid);
                    buf.put_u32(ioid);
                    buf.put_u8(flags.encode());
                    if let Some(body) = body {
                        buf.put_slice(&body);
                    }
                    control.flush();
                    Ok(())
                },
            )
            .await?;
        match reply {
            Reply::Data(data) => Ok(data),
            Reply::Empty => Err(ClientError::Unexpected(format!("{:?} reply without data", phase))),
            Reply::Types { .. } => Err(ClientError::Unexpected(format!("{:?} reply with types", phase))),
        }
    }

    /// Destroy the operation on the server; no reply is expected
    pub async fn destroy(mut self) -> ClientResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        let sid = self.channel.sid.load(Ordering::SeqCst);
        let ioid = self.ioid;
        self.channel
            .connection
            .transport
            .enqueue_send(move |control: &mut SendControl<'_>| -> Result<(), CodecError> {
                control.start_message(Command::DestroyRequest)?;
                let buf = control.buffer();
                buf.put_u32(sid);
                buf.put_u32(ioid);
                control.flush();
                Ok(())
            })
            .await?;
        Ok(())
    }
}
