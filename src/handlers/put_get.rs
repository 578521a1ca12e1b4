//! Put-get operations
//!
//! One [`PutGetRequest`] exists per live ioid on a channel. It moves through
//!
//! ```text
//! Uninitialized -> Connecting -> Ready -> (Getting | Putting | PutGetting)* -> Destroyed
//! ```
//!
//! and admits one phase at a time: the backend is moved into the task running
//! a phase and moved back when it completes. A message arriving while a phase
//! is in flight is answered with "other request pending" and never reaches the
//! backend. Responses are written by senders on the transport queue, so the
//! state returns to `Ready` only once the previous response was encoded.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::{Arc, Mutex, Weak};

use super::{send_status_response, CommandHandler, HandlerResult};
use crate::network::{lock, SendControl, ServerChannel, ServerConnection, Transport};
use crate::protocol::{get_u32, get_u8, CodecError, Command, Phase, RequestFlags, Status};
use crate::provider::{ChannelPutGet, Completion, FieldData, PutGetConnection};
use crate::pvdata::{deserialize_changed, serialize_changed, BitSet, PvStructure, Structure};

/// Lifecycle state of a put-get operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Uninitialized,
    Connecting,
    Ready,
    Getting,
    /// Reading back the put side
    Putting,
    PutGetting,
    Destroyed,
}

struct PutGetState {
    phase: RequestPhase,
    backend: Option<Box<dyn ChannelPutGet>>,
    put_value: Option<PvStructure>,
}

/// Backend call selected by a phase message
enum PhaseJob {
    Get,
    GetPut,
    PutGet(PvStructure, BitSet),
}

/// Payload following the status of a response
enum ResponseBody {
    Empty,
    Types {
        put: Option<Arc<Structure>>,
        get: Option<Arc<Structure>>,
    },
    Data(Bytes),
}

/// Server side of one put-get operation
pub struct PutGetRequest {
    ioid: u32,
    channel: Weak<ServerChannel>,
    transport: Arc<Transport>,
    state: Mutex<PutGetState>,
}

impl PutGetRequest {
    pub fn new(ioid: u32, channel: &Arc<ServerChannel>, transport: Arc<Transport>) -> Arc<Self> {
        Arc::new(Self {
            ioid,
            channel: Arc::downgrade(channel),
            transport,
            state: Mutex::new(PutGetState {
                phase: RequestPhase::Uninitialized,
                backend: None,
                put_value: None,
            }),
        })
    }

    pub fn ioid(&self) -> u32 {
        self.ioid
    }

    pub fn phase(&self) -> RequestPhase {
        lock(&self.state).phase
    }

    /// Connect the backend in the background and answer the INIT
    pub(crate) fn connect(
        self: &Arc<Self>,
        flags: RequestFlags,
        qos: u8,
        mut backend: Box<dyn ChannelPutGet>,
    ) {
        lock(&self.state).phase = RequestPhase::Connecting;
        let me = self.clone();
        tokio::spawn(async move {
            let connection = backend.connect().await;
            me.connected(flags, qos, backend, connection);
        });
    }

    fn connected(
        self: &Arc<Self>,
        flags: RequestFlags,
        qos: u8,
        backend: Box<dyn ChannelPutGet>,
        connection: PutGetConnection,
    ) {
        let PutGetConnection {
            status,
            put_structure,
            get_structure,
        } = connection;
        let success = status.is_success();
        {
            let mut state = lock(&self.state);
            if state.phase == RequestPhase::Destroyed {
                drop(state);
                destroy_backend(backend);
                return;
            }
            state.backend = Some(backend);
            if success {
                state.put_value = put_structure.clone().map(PvStructure::new);
            }
        }

        if !success {
            tracing::info!("Put-get {} failed to connect: {}", self.ioid, status);
        }
        let body = if success {
            ResponseBody::Types {
                put: put_structure,
                get: get_structure,
            }
        } else {
            ResponseBody::Empty
        };
        self.send_response(qos, status, body, !success || flags.last);
    }

    /// Start a GET, GET_PUT or PUT_GET phase
    pub(crate) fn start_phase(self: &Arc<Self>, flags: RequestFlags, qos: u8, mut payload: Bytes) {
        let started = {
            let mut state = lock(&self.state);
            self.begin(&mut state, flags, &mut payload)
        };
        let (mut backend, job) = match started {
            Ok(started) => started,
            Err(status) => {
                // A phase still in flight owns the backend and settles the operation
                let in_flight = status == Status::other_request_pending();
                send_status_response(&self.transport, Command::PutGet, self.ioid, qos, status);
                if flags.last && !in_flight {
                    self.destroy();
                }
                return;
            }
        };

        let me = self.clone();
        tokio::spawn(async move {
            if flags.last {
                backend.last_request();
            }
            let completion = match &job {
                PhaseJob::Get => backend.get().await,
                PhaseJob::GetPut => backend.get_put().await,
                PhaseJob::PutGet(value, changed) => backend.put_get(value, changed).await,
            };
            drop(job);
            me.completed(flags, qos, backend, completion);
        });
    }

    /// Check the guard and claim the backend; runs under the state lock
    fn begin(
        &self,
        state: &mut PutGetState,
        flags: RequestFlags,
        payload: &mut Bytes,
    ) -> Result<(Box<dyn ChannelPutGet>, PhaseJob), Status> {
        match state.phase {
            RequestPhase::Ready => {}
            RequestPhase::Destroyed => return Err(Status::bad_ioid()),
            _ => return Err(Status::other_request_pending()),
        }
        let (job, next) = match flags.phase {
            Phase::Init => return Err(Status::ioid_in_use()),
            Phase::Get => (PhaseJob::Get, RequestPhase::Getting),
            Phase::GetPut => (PhaseJob::GetPut, RequestPhase::Putting),
            Phase::PutGet => {
                let Some(put_value) = state.put_value.as_mut() else {
                    return Err(Status::error("operation has no put structure"));
                };
                let changed = deserialize_changed(put_value, payload)
                    .map_err(|e| Status::fatal(format!("malformed put data: {}", e)))?;
                (
                    PhaseJob::PutGet(put_value.clone(), changed),
                    RequestPhase::PutGetting,
                )
            }
        };
        let backend = state
            .backend
            .take()
            .ok_or_else(Status::other_request_pending)?;
        state.phase = next;
        Ok((backend, job))
    }

    fn completed(
        self: &Arc<Self>,
        flags: RequestFlags,
        qos: u8,
        backend: Box<dyn ChannelPutGet>,
        completion: Completion,
    ) {
        {
            let mut state = lock(&self.state);
            if state.phase == RequestPhase::Destroyed {
                drop(state);
                destroy_backend(backend);
                return;
            }
            state.backend = Some(backend);
        }

        let Completion { status, data } = completion;
        let (status, body) = if status.is_success() {
            let data = data.unwrap_or_else(|| FieldData {
                value: PvStructure::new(Structure::builder("").build()),
                changed: BitSet::new(),
            });
            let mut buf = BytesMut::new();
            match serialize_changed(&data.value, &data.changed, &mut buf) {
                Ok(()) => (status, ResponseBody::Data(buf.freeze())),
                Err(e) => {
                    tracing::warn!("Put-get {} result not encodable: {}", self.ioid, e);
                    (
                        Status::error(format!("cannot encode result: {}", e)),
                        ResponseBody::Empty,
                    )
                }
            }
        } else {
            (status, ResponseBody::Empty)
        };
        self.send_response(qos, status, body, flags.last);
    }

    fn send_response(self: &Arc<Self>, qos: u8, status: Status, body: ResponseBody, finish: bool) {
        let me = self.clone();
        let queued = self.transport.enqueue_send_nowait(
            move |control: &mut SendControl<'_>| -> Result<(), CodecError> {
                let result = me.write_response(control, qos, &status, body);
                me.response_written(finish);
                result
            },
        );
        if queued.is_err() {
            tracing::debug!("Put-get {} response dropped, connection closed", self.ioid);
            self.destroy();
        }
    }

    fn write_response(
        &self,
        control: &mut SendControl<'_>,
        qos: u8,
        status: &Status,
        body: ResponseBody,
    ) -> Result<(), CodecError> {
        control.start_message(Command::PutGet)?;
        let buf = control.buffer();
        buf.put_u32(self.ioid);
        buf.put_u8(qos);
        status.serialize(buf);
        match body {
            ResponseBody::Empty => {}
            ResponseBody::Types { put, get } => {
                control.serialize_structure(put.as_ref());
                control.serialize_structure(get.as_ref());
            }
            ResponseBody::Data(data) => control.buffer().put_slice(&data),
        }
        control.flush();
        Ok(())
    }

    fn response_written(&self, finish: bool) {
        if finish {
            self.destroy();
            return;
        }
        let mut state = lock(&self.state);
        if state.phase != RequestPhase::Destroyed {
            state.phase = RequestPhase::Ready;
        }
    }

    /// Unregister and destroy the backend; a phase in flight destroys it on completion
    pub fn destroy(&self) {
        let backend = {
            let mut state = lock(&self.state);
            if state.phase == RequestPhase::Destroyed {
                return;
            }
            state.phase = RequestPhase::Destroyed;
            state.put_value = None;
            state.backend.take()
        };
        if let Some(channel) = self.channel.upgrade() {
            channel.unregister(self.ioid);
        }
        if let Some(backend) = backend {
            destroy_backend(backend);
        }
        tracing::debug!("Put-get {} destroyed", self.ioid);
    }
}

fn destroy_backend(mut backend: Box<dyn ChannelPutGet>) {
    backend.destroy();
}

/// PUT_GET: `sid u32, ioid u32, qos u8` followed by the phase payload
pub struct PutGetHandler;

impl CommandHandler for PutGetHandler {
    fn handle(&self, connection: &Arc<ServerConnection>, mut payload: Bytes) -> HandlerResult<()> {
        let sid = get_u32(&mut payload)?;
        let ioid = get_u32(&mut payload)?;
        let qos = get_u8(&mut payload)?;
        let flags = RequestFlags::decode(qos);
        let transport = connection.transport();

        let Some(channel) = connection.channel(sid) else {
            send_status_response(transport, Command::PutGet, ioid, qos, Status::bad_cid());
            return Ok(());
        };

        if flags.phase != Phase::Init {
            match channel.request(ioid) {
                Some(request) => request.start_phase(flags, qos, payload),
                None => {
                    send_status_response(transport, Command::PutGet, ioid, qos, Status::bad_ioid())
                }
            }
            return Ok(());
        }

        if channel.request(ioid).is_some() {
            send_status_response(transport, Command::PutGet, ioid, qos, Status::ioid_in_use());
            return Ok(());
        }
        let request = match decode_request(transport, &mut payload) {
            Ok(request) => request,
            Err(e) => {
                let status = Status::fatal(format!("malformed request: {}", e));
                send_status_response(transport, Command::PutGet, ioid, qos, status);
                return Ok(());
            }
        };
        let backend = match channel.backend().create_put_get(&request) {
            Ok(backend) => backend,
            Err(status) => {
                send_status_response(transport, Command::PutGet, ioid, qos, status);
                return Ok(());
            }
        };

        let operation = PutGetRequest::new(ioid, &channel, transport.clone());
        if !channel.register(ioid, operation.clone()) {
            destroy_backend(backend);
            send_status_response(transport, Command::PutGet, ioid, qos, Status::ioid_in_use());
            return Ok(());
        }
        tracing::debug!("Put-get {} created on channel '{}'", ioid, channel.name());
        operation.connect(flags, qos, backend);
        Ok(())
    }
}

/// Decode the request descriptor: a cached structure type and its full value
fn decode_request(transport: &Transport, payload: &mut Bytes) -> Result<PvStructure, CodecError> {
    let structure = transport.registry().deserialize_structure(payload)?;
    match structure {
        Some(structure) => PvStructure::deserialize(structure, payload),
        None => Ok(PvStructure::new(Structure::builder("").build())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::Dispatcher;
    use crate::network::test_support::options;
    use crate::network::{FlushStrategy, Framed, Role};
    use crate::protocol::{
        Decoder, Encoder, StatusType, DEFAULT_MAX_PAYLOAD_SIZE, QOS_DESTROY, QOS_GET, QOS_INIT,
    };
    use crate::provider::{Channel, MemoryProvider};
    use crate::pvdata::{IntrospectionRegistry, ScalarType, ScalarValue};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Calls {
        connect: AtomicUsize,
        get: AtomicUsize,
        get_put: AtomicUsize,
        put_get: AtomicUsize,
        last: AtomicUsize,
        destroy: AtomicUsize,
        puts: Mutex<Vec<(PvStructure, BitSet)>>,
    }

    fn sample() -> PvStructure {
        let mut value = PvStructure::new(Structure::nt_scalar(ScalarType::Double));
        value.set("value", ScalarValue::Double(3.5)).unwrap();
        value
    }

    #[derive(Default)]
    struct MockChannel {
        calls: Arc<Calls>,
        gate: Option<Arc<Notify>>,
        fail_create: bool,
        fail_connect: bool,
    }

    impl Channel for MockChannel {
        fn name(&self) -> &str {
            "mock"
        }

        fn create_put_get(&self, _request: &PvStructure) -> Result<Box<dyn ChannelPutGet>, Status> {
            if self.fail_create {
                return Err(Status::error("no backend"));
            }
            Ok(Box::new(MockPutGet {
                calls: self.calls.clone(),
                gate: self.gate.clone(),
                fail_connect: self.fail_connect,
            }))
        }
    }

    struct MockPutGet {
        calls: Arc<Calls>,
        gate: Option<Arc<Notify>>,
        fail_connect: bool,
    }

    #[async_trait]
    impl ChannelPutGet for MockPutGet {
        async fn connect(&mut self) -> PutGetConnection {
            self.calls.connect.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return PutGetConnection::failed(Status::error("connect refused"));
            }
            let shape = Structure::nt_scalar(ScalarType::Double);
            PutGetConnection::ok(shape.clone(), shape)
        }

        async fn get(&mut self) -> Completion {
            self.calls.get.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Completion::ok(FieldData {
                value: sample(),
                changed: BitSet::from_iter([1]),
            })
        }

        async fn get_put(&mut self) -> Completion {
            self.calls.get_put.fetch_add(1, Ordering::SeqCst);
            Completion::ok(FieldData::full(sample()))
        }

        async fn put(&mut self, _value: &PvStructure, _changed: &BitSet) -> Completion {
            Completion::done()
        }

        async fn put_get(&mut self, value: &PvStructure, changed: &BitSet) -> Completion {
            self.calls.put_get.fetch_add(1, Ordering::SeqCst);
            self.calls
                .puts
                .lock()
                .unwrap()
                .push((value.clone(), changed.clone()));
            Completion::ok(FieldData {
                value: value.clone(),
                changed: changed.clone(),
            })
        }

        fn last_request(&mut self) {
            self.calls.last.fetch_add(1, Ordering::SeqCst);
        }

        fn destroy(&mut self) {
            self.calls.destroy.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Client end of the connection
    struct Peer {
        stream: DuplexStream,
        decoder: Decoder,
        buf: BytesMut,
        registry: IntrospectionRegistry,
    }

    impl Peer {
        async fn send(&mut self, payload: &[u8]) {
            let mut out = BytesMut::new();
            Encoder::client()
                .encode(Command::PutGet, payload, &mut out)
                .unwrap();
            self.stream.write_all(&out).await.unwrap();
        }

        async fn send_init(&mut self, sid: u32, ioid: u32, flags: RequestFlags) {
            let mut payload = header(sid, ioid, flags);
            let request = Structure::builder("request")
                .scalar("record", ScalarType::String)
                .build();
            self.registry
                .serialize_structure(Some(&request), &mut payload);
            PvStructure::new(request).serialize(&mut payload).unwrap();
            self.send(&payload).await;
        }

        async fn recv(&mut self) -> (u32, u8, Status, Bytes) {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                    assert_eq!(frame.command().unwrap(), Command::PutGet);
                    let mut payload = frame.payload;
                    let ioid = get_u32(&mut payload).unwrap();
                    let qos = get_u8(&mut payload).unwrap();
                    let status = Status::deserialize(&mut payload).unwrap();
                    return (ioid, qos, status, payload);
                }
                let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read_buf(&mut self.buf))
                    .await
                    .expect("response timeout")
                    .unwrap();
                assert!(n > 0, "connection closed");
            }
        }

        /// True when nothing else arrives for a while
        async fn silent(&mut self) -> bool {
            let read =
                tokio::time::timeout(Duration::from_millis(100), self.stream.read_buf(&mut self.buf))
                    .await;
            read.is_err() && self.buf.is_empty()
        }
    }

    fn header(sid: u32, ioid: u32, flags: RequestFlags) -> BytesMut {
        let mut payload = BytesMut::new();
        payload.put_u32(sid);
        payload.put_u32(ioid);
        payload.put_u8(flags.encode());
        payload
    }

    struct Fixture {
        connection: Arc<ServerConnection>,
        channel: Arc<ServerChannel>,
        sid: u32,
        calls: Arc<Calls>,
        peer: Peer,
    }

    fn fixture(mock: MockChannel) -> Fixture {
        let calls = mock.calls.clone();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:5075".parse().unwrap();
        let transport = Transport::new(
            addr,
            Role::Server,
            0,
            options(FlushStrategy::Immediate, Duration::from_secs(3600)),
            None,
        );
        let connection = ServerConnection::new(
            transport.clone(),
            Arc::new(MemoryProvider::new()),
            Arc::new(Dispatcher::server()),
        );
        transport.acquire(connection.clone());
        transport.start(
            Framed::new(local, Encoder::server(), DEFAULT_MAX_PAYLOAD_SIZE),
            connection.clone(),
        );
        let sid = connection
            .register_channel(1, "mock".into(), Arc::new(mock))
            .unwrap();
        let channel = connection.channel(sid).unwrap();
        Fixture {
            connection,
            channel,
            sid,
            calls,
            peer: Peer {
                stream: remote,
                decoder: Decoder::new(),
                buf: BytesMut::new(),
                registry: IntrospectionRegistry::new(),
            },
        }
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("counter stuck at {}", counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_init_then_get_with_destroy() {
        let mut f = fixture(MockChannel::default());

        f.peer.send_init(f.sid, 1, RequestFlags::new(Phase::Init)).await;
        let (ioid, qos, status, mut body) = f.peer.recv().await;
        assert_eq!(ioid, 1);
        assert_eq!(qos, QOS_INIT);
        assert!(status.is_success());
        let put = f.peer.registry.deserialize_structure(&mut body).unwrap().unwrap();
        let get = f.peer.registry.deserialize_structure(&mut body).unwrap().unwrap();
        assert_eq!(put, Structure::nt_scalar(ScalarType::Double));
        assert_eq!(get, put);

        let payload = header(f.sid, 1, RequestFlags::last(Phase::Get));
        f.peer.send(&payload).await;
        let (ioid, qos, status, mut body) = f.peer.recv().await;
        assert_eq!(ioid, 1);
        assert_eq!(qos, QOS_GET | QOS_DESTROY);
        assert!(status.is_success());
        let mut value = PvStructure::new(get);
        let changed = deserialize_changed(&mut value, &mut body).unwrap();
        assert_eq!(changed, BitSet::from_iter([1]));
        assert_eq!(value.scalar("value"), Some(&ScalarValue::Double(3.5)));

        assert!(f.peer.silent().await);
        assert!(f.channel.request(1).is_none());
        assert_eq!(f.calls.get.load(Ordering::SeqCst), 1);
        assert_eq!(f.calls.last.load(Ordering::SeqCst), 1);
        assert_eq!(f.calls.destroy.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_phase_before_init_is_rejected() {
        let mut f = fixture(MockChannel::default());

        let payload = header(f.sid, 5, RequestFlags::new(Phase::Get));
        f.peer.send(&payload).await;
        let (ioid, _, status, _) = f.peer.recv().await;
        assert_eq!(ioid, 5);
        assert_eq!(status, Status::bad_ioid());

        assert!(f.peer.silent().await);
        assert_eq!(f.calls.connect.load(Ordering::SeqCst), 0);
        assert_eq!(f.calls.get.load(Ordering::SeqCst), 0);
        assert!(!f.connection.transport().is_closed());
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let mut f = fixture(MockChannel::default());

        f.peer.send_init(f.sid + 100, 1, RequestFlags::new(Phase::Init)).await;
        let (_, _, status, _) = f.peer.recv().await;
        assert_eq!(status, Status::bad_cid());
        assert_eq!(f.channel.request_count(), 0);
    }

    #[tokio::test]
    async fn test_reinit_of_live_ioid() {
        let mut f = fixture(MockChannel::default());

        f.peer.send_init(f.sid, 1, RequestFlags::new(Phase::Init)).await;
        assert!(f.peer.recv().await.2.is_success());
        f.peer.send_init(f.sid, 1, RequestFlags::new(Phase::Init)).await;
        let (_, _, status, _) = f.peer.recv().await;
        assert_eq!(status, Status::ioid_in_use());

        assert_eq!(f.calls.connect.load(Ordering::SeqCst), 1);
        assert_eq!(f.channel.request(1).unwrap().phase(), RequestPhase::Ready);
    }

    #[tokio::test]
    async fn test_pending_phase_is_rejected() {
        let gate = Arc::new(Notify::new());
        let mut f = fixture(MockChannel {
            gate: Some(gate.clone()),
            ..Default::default()
        });

        f.peer.send_init(f.sid, 1, RequestFlags::new(Phase::Init)).await;
        assert!(f.peer.recv().await.2.is_success());

        let payload = header(f.sid, 1, RequestFlags::new(Phase::Get));
        f.peer.send(&payload).await;
        f.peer.send(&payload).await;
        let (_, _, status, _) = f.peer.recv().await;
        assert_eq!(status, Status::other_request_pending());
        wait_for(&f.calls.get, 1).await;

        gate.notify_one();
        let (_, qos, status, _) = f.peer.recv().await;
        assert_eq!(qos, QOS_GET);
        assert!(status.is_success());
        assert_eq!(f.calls.get.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_construction_failure_registers_nothing() {
        let mut f = fixture(MockChannel {
            fail_create: true,
            ..Default::default()
        });

        f.peer.send_init(f.sid, 1, RequestFlags::new(Phase::Init)).await;
        let (_, _, status, body) = f.peer.recv().await;
        assert_eq!(status.kind, StatusType::Error);
        assert_eq!(status.message, "no backend");
        assert!(body.is_empty());
        assert_eq!(f.channel.request_count(), 0);
        assert_eq!(f.calls.connect.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_tears_down() {
        let mut f = fixture(MockChannel {
            fail_connect: true,
            ..Default::default()
        });

        f.peer.send_init(f.sid, 1, RequestFlags::new(Phase::Init)).await;
        let (_, _, status, body) = f.peer.recv().await;
        assert!(!status.is_success());
        assert!(body.is_empty());
        assert_eq!(f.channel.request_count(), 0);
        assert_eq!(f.calls.destroy.load(Ordering::SeqCst), 1);

        let payload = header(f.sid, 1, RequestFlags::new(Phase::Get));
        f.peer.send(&payload).await;
        assert_eq!(f.peer.recv().await.2, Status::bad_ioid());
    }

    #[tokio::test]
    async fn test_put_get_applies_masked_fields() {
        let mut f = fixture(MockChannel::default());

        f.peer.send_init(f.sid, 1, RequestFlags::new(Phase::Init)).await;
        let (_, _, _, mut body) = f.peer.recv().await;
        let put = f.peer.registry.deserialize_structure(&mut body).unwrap().unwrap();

        let mut update = PvStructure::new(put.clone());
        let offset = update.set("value", ScalarValue::Double(9.0)).unwrap();
        update
            .set("alarm.message", ScalarValue::String("not sent".into()))
            .unwrap();
        let mut payload = header(f.sid, 1, RequestFlags::new(Phase::PutGet));
        serialize_changed(&update, &BitSet::from_iter([offset]), &mut payload).unwrap();
        f.peer.send(&payload).await;

        let (_, qos, status, mut body) = f.peer.recv().await;
        assert_eq!(qos, 0);
        assert!(status.is_success());
        let mut result = PvStructure::new(put);
        let changed = deserialize_changed(&mut result, &mut body).unwrap();
        assert_eq!(changed, BitSet::from_iter([offset]));
        assert_eq!(result.scalar("value"), Some(&ScalarValue::Double(9.0)));

        let puts = f.calls.puts.lock().unwrap();
        let (received, mask) = &puts[0];
        assert_eq!(mask, &BitSet::from_iter([offset]));
        assert_eq!(received.scalar("value"), Some(&ScalarValue::Double(9.0)));
        assert_eq!(
            received.scalar("alarm.message"),
            Some(&ScalarValue::String(String::new()))
        );
    }

    #[tokio::test]
    async fn test_malformed_request_keeps_connection() {
        let mut f = fixture(MockChannel::default());

        let mut payload = header(f.sid, 1, RequestFlags::new(Phase::Init));
        payload.put_u8(0xFD);
        f.peer.send(&payload).await;
        let (_, _, status, _) = f.peer.recv().await;
        assert_eq!(status.kind, StatusType::Fatal);
        assert!(status.message.starts_with("malformed request"));
        assert_eq!(f.channel.request_count(), 0);
        assert!(!f.connection.transport().is_closed());
    }

    #[tokio::test]
    async fn test_failed_phase_with_destroy_flag() {
        let mut f = fixture(MockChannel::default());

        f.peer.send_init(f.sid, 1, RequestFlags::new(Phase::Init)).await;
        assert!(f.peer.recv().await.2.is_success());

        // mask names the value field but no data follows
        let mut payload = header(f.sid, 1, RequestFlags::last(Phase::PutGet));
        BitSet::from_iter([1]).serialize(&mut payload);
        f.peer.send(&payload).await;
        let (ioid, qos, status, _) = f.peer.recv().await;
        assert_eq!(ioid, 1);
        assert_eq!(qos, QOS_DESTROY);
        assert_eq!(status.kind, StatusType::Fatal);
        assert!(status.message.starts_with("malformed put data"));

        wait_for(&f.calls.destroy, 1).await;
        assert!(f.channel.request(1).is_none());
        assert_eq!(f.calls.put_get.load(Ordering::SeqCst), 0);
        assert!(!f.connection.transport().is_closed());
    }

    #[tokio::test]
    async fn test_pending_rejection_ignores_destroy_flag() {
        let gate = Arc::new(Notify::new());
        let mut f = fixture(MockChannel {
            gate: Some(gate.clone()),
            ..Default::default()
        });

        f.peer.send_init(f.sid, 1, RequestFlags::new(Phase::Init)).await;
        assert!(f.peer.recv().await.2.is_success());

        f.peer.send(&header(f.sid, 1, RequestFlags::new(Phase::Get))).await;
        wait_for(&f.calls.get, 1).await;
        f.peer.send(&header(f.sid, 1, RequestFlags::last(Phase::Get))).await;
        let (_, qos, status, _) = f.peer.recv().await;
        assert_eq!(qos, QOS_GET | QOS_DESTROY);
        assert_eq!(status, Status::other_request_pending());
        assert_eq!(f.channel.request(1).unwrap().phase(), RequestPhase::Getting);

        gate.notify_one();
        let (_, qos, status, _) = f.peer.recv().await;
        assert_eq!(qos, QOS_GET);
        assert!(status.is_success());
        assert_eq!(f.channel.request(1).unwrap().phase(), RequestPhase::Ready);
        assert_eq!(f.calls.destroy.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deeply_nested_request_keeps_connection() {
        let mut f = fixture(MockChannel::default());

        let mut payload = header(f.sid, 1, RequestFlags::new(Phase::Init));
        payload.put_u8(0xFD);
        payload.put_u16(1);
        for _ in 0..200_000 {
            payload.put_slice(&[0x80, 0, 1, 0]);
        }
        payload.put_u8(ScalarType::Double.type_code());
        f.peer.send(&payload).await;

        let (ioid, _, status, _) = f.peer.recv().await;
        assert_eq!(ioid, 1);
        assert_eq!(status.kind, StatusType::Fatal);
        assert!(status.message.starts_with("malformed request"));
        assert_eq!(f.channel.request_count(), 0);
        assert!(!f.connection.transport().is_closed());

        f.peer.send_init(f.sid, 2, RequestFlags::new(Phase::Init)).await;
        assert!(f.peer.recv().await.2.is_success());
    }

    #[tokio::test]
    async fn test_teardown_during_phase() {
        let gate = Arc::new(Notify::new());
        let mut f = fixture(MockChannel {
            gate: Some(gate.clone()),
            ..Default::default()
        });

        f.peer.send_init(f.sid, 1, RequestFlags::new(Phase::Init)).await;
        assert!(f.peer.recv().await.2.is_success());
        let request = f.channel.request(1).unwrap();

        let payload = header(f.sid, 1, RequestFlags::new(Phase::Get));
        f.peer.send(&payload).await;
        wait_for(&f.calls.get, 1).await;

        f.connection.transport().force_close();
        assert_eq!(request.phase(), RequestPhase::Destroyed);
        assert_eq!(f.connection.channel_count(), 0);
        assert_eq!(f.calls.destroy.load(Ordering::SeqCst), 0);

        gate.notify_one();
        wait_for(&f.calls.destroy, 1).await;
    }
}
