//! Established connections
//!
//! A [`Transport`] owns one byte stream after a successful handshake. Two
//! tasks serve it:
//! - the reader decodes frames, refreshes liveness and hands each frame to a
//!   [`FrameHandler`]
//! - the writer is the only code that writes the stream; it drains the send
//!   queue in FIFO order, running one [`TransportSender`] at a time
//!
//! Client-side users hold the connection open by acquiring it as owners.
//! Releasing the last owner closes it. An I/O or framing error closes it
//! regardless of owners and notifies every one of them.

use bytes::BytesMut;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{lock, watchdog, Framed};
use crate::protocol::{CodecError, Command, Decoder, Encoder, Frame};
use crate::pvdata::{Field, IntrospectionRegistry, Structure};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Connection timeout")]
    Timeout,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Which end of the connection this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn encoder(self) -> Encoder {
        match self {
            Role::Client => Encoder::client(),
            Role::Server => Encoder::server(),
        }
    }
}

/// When queued messages are written to the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStrategy {
    /// Every message is written and flushed as soon as it is encoded
    Immediate,
    /// Messages accumulate until a flush is requested or `max_bytes` is reached
    Buffered { max_bytes: usize },
}

/// Per-connection settings
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub connection_timeout: Duration,
    pub flush_strategy: FlushStrategy,
    pub max_payload_size: usize,
    pub registry_max_size: u16,
}

/// Connection state changes, emitted on the optional event channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// Emitted exactly once per connection
    Closed { forced: bool },
    Unresponsive,
    Responsive,
    /// The peer restarted; cached types were discarded
    Changed,
}

/// A holder of a connection, notified about its state.
///
/// Callbacks run on runtime tasks and must not block.
pub trait TransportClient: Send + Sync {
    /// Identity within one connection's owner set
    fn client_id(&self) -> u32;

    fn transport_closed(&self);

    fn transport_unresponsive(&self) {}

    fn transport_responsive(&self) {}

    fn transport_changed(&self) {}
}

/// Receives every frame read from a connection, in stream order
pub trait FrameHandler: Send + Sync {
    fn handle_frame(&self, transport: &Arc<Transport>, frame: Frame);
}

/// Writes one or more messages when the writer task reaches it in the queue
pub trait TransportSender: Send {
    fn send(self: Box<Self>, control: &mut SendControl<'_>) -> Result<(), CodecError>;
}

impl<F> TransportSender for F
where
    F: FnOnce(&mut SendControl<'_>) -> Result<(), CodecError> + Send,
{
    fn send(self: Box<Self>, control: &mut SendControl<'_>) -> Result<(), CodecError> {
        (*self)(control)
    }
}

/// Writer-side view handed to a [`TransportSender`]
pub struct SendControl<'a> {
    transport: &'a Transport,
    buf: &'a mut BytesMut,
    open_message: Option<usize>,
    flush_requested: bool,
    registered: Vec<Arc<Structure>>,
}

impl<'a> SendControl<'a> {
    /// Write a message header; the payload follows in [`SendControl::buffer`]
    pub fn start_message(&mut self, command: Command) -> Result<(), CodecError> {
        self.end_message()?;
        self.open_message = Some(self.transport.encoder.begin_message(command, &mut *self.buf));
        Ok(())
    }

    /// Close the open message, patching its payload length
    pub fn end_message(&mut self) -> Result<(), CodecError> {
        match self.open_message.take() {
            Some(start) => self.transport.encoder.end_message(start, &mut *self.buf),
            None => Ok(()),
        }
    }

    pub fn buffer(&mut self) -> &mut BytesMut {
        &mut *self.buf
    }

    /// Write a structure descriptor through the connection's type cache
    pub fn serialize_structure(&mut self, structure: Option<&Arc<Structure>>) {
        let registered = self
            .transport
            .registry()
            .serialize_structure(structure, &mut *self.buf);
        if let (true, Some(structure)) = (registered, structure) {
            self.registered.push(structure.clone());
        }
    }

    /// Write any descriptor through the connection's type cache
    pub fn serialize_field(&mut self, field: Option<&Field>) {
        match field {
            Some(Field::Structure(structure)) => self.serialize_structure(Some(structure)),
            other => {
                self.transport.registry().serialize_field(other, &mut *self.buf);
            }
        }
    }

    /// Ask the writer to put everything buffered so far on the wire
    pub fn flush(&mut self) {
        self.flush_requested = true;
    }
}

enum SendRequest {
    Message {
        sender: Box<dyn TransportSender>,
        done: Option<oneshot::Sender<TransportResult<()>>>,
    },
    Flush,
    /// Write what is pending, then shut the stream down
    Close,
}

#[derive(Default)]
struct Owners {
    closed: bool,
    clients: BTreeMap<u32, Arc<dyn TransportClient>>,
}

struct Liveness {
    last_alive: Instant,
    unresponsive: bool,
}

/// One established connection
pub struct Transport {
    remote_addr: SocketAddr,
    role: Role,
    priority: i16,
    encoder: Encoder,
    options: TransportOptions,
    remote_revision: AtomicU8,
    owners: Mutex<Owners>,
    liveness: Mutex<Liveness>,
    registry: Mutex<IntrospectionRegistry>,
    send_tx: mpsc::UnboundedSender<SendRequest>,
    send_rx: Mutex<Option<mpsc::UnboundedReceiver<SendRequest>>>,
    shutdown_tx: watch::Sender<bool>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl Transport {
    /// Create a connection record; nothing is read or written until [`Transport::start`]
    pub fn new(
        remote_addr: SocketAddr,
        role: Role,
        priority: i16,
        options: TransportOptions,
        events: Option<mpsc::UnboundedSender<TransportEvent>>,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            remote_addr,
            role,
            priority,
            encoder: role.encoder().with_max_payload(options.max_payload_size),
            options,
            remote_revision: AtomicU8::new(0),
            owners: Mutex::new(Owners::default()),
            liveness: Mutex::new(Liveness {
                last_alive: Instant::now(),
                unresponsive: false,
            }),
            registry: Mutex::new(IntrospectionRegistry::with_max_size(options.registry_max_size)),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            shutdown_tx,
            events,
        })
    }

    /// Spawn the reader and writer tasks, plus the watchdog on client connections
    pub fn start<S>(self: &Arc<Self>, framed: Framed<S>, handler: Arc<dyn FrameHandler>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(send_rx) = lock(&self.send_rx).take() else {
            tracing::warn!("Transport to {} already started", self.remote_addr);
            return;
        };
        self.remote_revision
            .store(framed.peer_revision(), Ordering::SeqCst);

        let (stream, decoder, read_buf) = framed.into_parts();
        let (reader, writer) = tokio::io::split(stream);

        tokio::spawn(read_loop(
            self.clone(),
            reader,
            decoder,
            read_buf,
            handler,
            self.shutdown_tx.subscribe(),
        ));
        tokio::spawn(write_loop(
            self.clone(),
            writer,
            send_rx,
            self.shutdown_tx.subscribe(),
        ));
        if self.role == Role::Client {
            watchdog::spawn(Arc::downgrade(self), self.options.connection_timeout);
        }

        tracing::info!(
            "Connection to {} established (priority {})",
            self.remote_addr,
            self.priority
        );
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn priority(&self) -> i16 {
        self.priority
    }

    pub fn flush_strategy(&self) -> FlushStrategy {
        self.options.flush_strategy
    }

    pub fn connection_timeout(&self) -> Duration {
        self.options.connection_timeout
    }

    /// Protocol revision the peer announced in its frame headers
    pub fn remote_revision(&self) -> u8 {
        self.remote_revision.load(Ordering::SeqCst)
    }

    /// The connection's type cache, for decoding received descriptors
    pub fn registry(&self) -> MutexGuard<'_, IntrospectionRegistry> {
        lock(&self.registry)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.owners).closed
    }

    pub fn owner_count(&self) -> usize {
        lock(&self.owners).clients.len()
    }

    /// Register an owner; false if the connection is already closed
    pub fn acquire(&self, owner: Arc<dyn TransportClient>) -> bool {
        let mut owners = lock(&self.owners);
        if owners.closed {
            return false;
        }
        tracing::debug!(
            "Owner {} acquired connection to {}",
            owner.client_id(),
            self.remote_addr
        );
        owners.clients.insert(owner.client_id(), owner);
        true
    }

    /// Remove an owner; removing the last one closes the connection
    pub fn release(&self, owner: &dyn TransportClient) {
        let detached = {
            let mut owners = lock(&self.owners);
            if owners.clients.remove(&owner.client_id()).is_none() {
                return;
            }
            tracing::debug!(
                "Owner {} released connection to {}",
                owner.client_id(),
                self.remote_addr
            );
            if !owners.clients.is_empty() || owners.closed {
                return;
            }
            owners.closed = true;
            std::mem::take(&mut owners.clients)
        };
        self.finish_close(detached, false);
    }

    /// Close unconditionally after a failure, notifying every owner
    pub(crate) fn force_close(&self) {
        let detached = {
            let mut owners = lock(&self.owners);
            if owners.closed {
                return;
            }
            owners.closed = true;
            std::mem::take(&mut owners.clients)
        };
        self.finish_close(detached, true);
    }

    fn finish_close(&self, detached: BTreeMap<u32, Arc<dyn TransportClient>>, forced: bool) {
        if forced {
            tracing::warn!("Connection to {} closed on failure", self.remote_addr);
            self.shutdown_tx.send_replace(true);
        } else {
            tracing::info!("Connection to {} closed", self.remote_addr);
            if self.send_tx.send(SendRequest::Close).is_err() {
                self.shutdown_tx.send_replace(true);
            }
        }
        for owner in detached.values() {
            notify(owner.as_ref(), "closed", |o| o.transport_closed());
        }
        self.emit(TransportEvent::Closed { forced });
    }

    /// Queue a sender and wait until its bytes were written.
    ///
    /// With [`FlushStrategy::Buffered`] this waits for the next flush.
    pub async fn enqueue_send<S>(&self, sender: S) -> TransportResult<()>
    where
        S: TransportSender + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.push(SendRequest::Message {
            sender: Box::new(sender),
            done: Some(done_tx),
        })?;
        done_rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Queue a sender without waiting; ordering with [`Transport::enqueue_send`] is kept
    pub fn enqueue_send_nowait<S>(&self, sender: S) -> TransportResult<()>
    where
        S: TransportSender + 'static,
    {
        self.push(SendRequest::Message {
            sender: Box::new(sender),
            done: None,
        })
    }

    /// Write everything queued before this call
    pub fn flush(&self) -> TransportResult<()> {
        self.push(SendRequest::Flush)
    }

    fn push(&self, request: SendRequest) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.send_tx
            .send(request)
            .map_err(|_| TransportError::Closed)
    }

    /// Record inbound traffic; clears the unresponsive flag
    pub fn alive_notification(&self) {
        let recovered = {
            let mut liveness = lock(&self.liveness);
            liveness.last_alive = Instant::now();
            std::mem::replace(&mut liveness.unresponsive, false)
        };
        if recovered {
            tracing::info!("Connection to {} is responsive again", self.remote_addr);
            self.notify_owners("responsive", |o| o.transport_responsive());
            self.emit(TransportEvent::Responsive);
        }
    }

    pub fn is_unresponsive(&self) -> bool {
        lock(&self.liveness).unresponsive
    }

    pub fn time_since_alive(&self) -> Duration {
        lock(&self.liveness).last_alive.elapsed()
    }

    pub(crate) fn mark_unresponsive(&self) {
        let changed = {
            let mut liveness = lock(&self.liveness);
            !std::mem::replace(&mut liveness.unresponsive, true)
        };
        if changed {
            tracing::warn!("Connection to {} is unresponsive", self.remote_addr);
            self.notify_owners("unresponsive", |o| o.transport_unresponsive());
            self.emit(TransportEvent::Unresponsive);
        }
    }

    /// Queue an echo request; any answer counts as an alive notification
    pub fn send_echo(&self) -> TransportResult<()> {
        tracing::debug!("Probing {} with echo", self.remote_addr);
        self.enqueue_send_nowait(|control: &mut SendControl<'_>| -> Result<(), CodecError> {
            control.start_message(Command::Echo)?;
            control.end_message()?;
            control.flush();
            Ok(())
        })
    }

    /// The peer restarted: drop cached types and tell the owners
    pub fn changed_transport(&self) {
        self.registry().reset();
        tracing::info!("Connection to {} changed, type cache reset", self.remote_addr);
        self.notify_owners("changed", |o| o.transport_changed());
        self.emit(TransportEvent::Changed);
    }

    fn notify_owners(&self, what: &str, f: impl Fn(&dyn TransportClient)) {
        let snapshot: Vec<Arc<dyn TransportClient>> =
            lock(&self.owners).clients.values().cloned().collect();
        for owner in &snapshot {
            notify(owner.as_ref(), what, &f);
        }
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Run one sender against the write buffer; a failing sender leaves no bytes behind
    fn run_sender(
        &self,
        sender: Box<dyn TransportSender>,
        buf: &mut BytesMut,
    ) -> Result<bool, CodecError> {
        let mark = buf.len();
        let mut control = SendControl {
            transport: self,
            buf: &mut *buf,
            open_message: None,
            flush_requested: false,
            registered: Vec::new(),
        };
        let result = sender.send(&mut control).and_then(|_| control.end_message());
        let flush_requested = control.flush_requested;
        let registered = std::mem::take(&mut control.registered);
        match result {
            Ok(()) => Ok(flush_requested),
            Err(e) => {
                buf.truncate(mark);
                let mut registry = self.registry();
                for structure in &registered {
                    registry.forget(structure);
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("remote_addr", &self.remote_addr)
            .field("role", &self.role)
            .field("priority", &self.priority)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn notify<F>(owner: &dyn TransportClient, what: &str, f: F)
where
    F: Fn(&dyn TransportClient),
{
    if catch_unwind(AssertUnwindSafe(|| f(owner))).is_err() {
        tracing::error!(
            "Owner {} panicked while handling '{}' notification",
            owner.client_id(),
            what
        );
    }
}

async fn read_loop<R>(
    transport: Arc<Transport>,
    mut reader: R,
    mut decoder: Decoder,
    mut buf: BytesMut,
    handler: Arc<dyn FrameHandler>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(frame)) => {
                    transport.alive_notification();
                    handler.handle_frame(&transport, frame);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Framing error from {}: {}", transport.remote_addr, e);
                    transport.force_close();
                    return;
                }
            }
        }

        if *shutdown.borrow() {
            return;
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => {
                    tracing::info!("Peer {} closed the connection", transport.remote_addr);
                    transport.force_close();
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Read error from {}: {}", transport.remote_addr, e);
                    transport.force_close();
                    return;
                }
            }
        }
    }
}

async fn write_loop<W>(
    transport: Arc<Transport>,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<SendRequest>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8192);
    let mut waiting: Vec<oneshot::Sender<TransportResult<()>>> = Vec::new();

    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            request = queue.recv() => request,
        };

        let write_now = match request {
            None => break,
            Some(SendRequest::Flush) => true,
            Some(SendRequest::Close) => {
                let _ = write_out(&mut writer, &mut buf, &mut waiting).await;
                let _ = writer.shutdown().await;
                break;
            }
            Some(SendRequest::Message { sender, done }) => {
                match transport.run_sender(sender, &mut buf) {
                    Ok(flush_requested) => {
                        waiting.extend(done);
                        match transport.options.flush_strategy {
                            FlushStrategy::Immediate => true,
                            FlushStrategy::Buffered { max_bytes } => {
                                flush_requested || buf.len() >= max_bytes
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Dropped message to {}: {}", transport.remote_addr, e);
                        if let Some(done) = done {
                            let _ = done.send(Err(TransportError::Protocol(e)));
                        }
                        false
                    }
                }
            }
        };

        if write_now {
            if let Err(e) = write_out(&mut writer, &mut buf, &mut waiting).await {
                tracing::error!("Write error to {}: {}", transport.remote_addr, e);
                transport.force_close();
                break;
            }
        }
    }

    for done in waiting.drain(..) {
        let _ = done.send(Err(TransportError::Closed));
    }
    transport.shutdown_tx.send_replace(true);
}

async fn write_out<W>(
    writer: &mut W,
    buf: &mut BytesMut,
    waiting: &mut Vec<oneshot::Sender<TransportResult<()>>>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !buf.is_empty() {
        writer.write_all(buf).await?;
        writer.flush().await?;
        buf.clear();
    }
    for done in waiting.drain(..) {
        let _ = done.send(Ok(()));
    }
    Ok(())
}
