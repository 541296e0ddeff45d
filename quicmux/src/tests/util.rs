use std::{
    cell::RefCell,
    collections::VecDeque,
    fs::File,
    io::{self, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    rc::Rc,
    str,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing_subscriber::EnvFilter;

use crate::{
    AddressFamily, CipherInfo, ClientConfig, ClientSessionParams, CloseCode, ConnectionHandle,
    Dir, EndpointConfig, EndpointHandle, EngineError, EngineEvent, Event, HandshakeInfo, Header,
    HeadersKind, ListenParams, Lookup, LookupToken, ResetDirections, SecureContext,
    ServerConfig, SessionEvent, SessionHandle, Side, Socket, SocketConfig, SocketEvent,
    SocketOptions, StreamEvent, StreamHandle, StreamId, TlsConfig, TlsError, TlsProvider,
    TransportEngine,
};

pub(super) const ALPN: &str = "h3";
pub(super) const SERVER_NAME: &str = "example.com";
pub(super) const SERVER_PORT: u16 = 4433;

/// A call made into the engine
#[derive(Debug, Clone, PartialEq)]
pub(super) enum Call {
    Configure,
    AddEndpoint {
        endpoint: EndpointHandle,
        preferred: bool,
    },
    CloseEndpoint(EndpointHandle),
    SetEndpointRef(EndpointHandle, bool),
    Listen {
        alpn: String,
        preferred_address: Option<SocketAddr>,
    },
    StopListening,
    ServerBusy(bool),
    StatelessResetDisabled(bool),
    PacketLoss(f64, f64),
    CreateClient {
        connection: ConnectionHandle,
        remote: SocketAddr,
        servername: String,
        auto_start: bool,
    },
    StartHandshake(ConnectionHandle),
    ClientHelloDone(ConnectionHandle, Option<String>),
    CertificateDone {
        connection: ConnectionHandle,
        context: Option<String>,
        ocsp: Option<Bytes>,
    },
    GracefulClose(ConnectionHandle),
    DestroySession {
        connection: ConnectionHandle,
        close: CloseCode,
        silent: bool,
    },
    Ping(ConnectionHandle),
    UpdateKey(ConnectionHandle),
    OpenStream(ConnectionHandle, Dir),
    Write(StreamId, Bytes),
    Shutdown(StreamId),
    ReadStart(StreamId),
    ReadStop(StreamId),
    Reset {
        stream: StreamId,
        code: CloseCode,
        directions: ResetDirections,
    },
    Headers {
        stream: StreamId,
        kind: HeadersKind,
        headers: Vec<Header>,
        terminal: bool,
    },
    SendFile {
        stream: StreamId,
        offset: Option<u64>,
        length: Option<u64>,
    },
    DestroyStream(StreamId),
}

#[derive(Default)]
pub(super) struct EngineState {
    pub(super) calls: Vec<Call>,
    /// Events the engine would report on its own, such as finished endpoint closes
    completions: VecDeque<EngineEvent>,
    sides: FxHashMap<ConnectionHandle, Side>,
    next_connection: u64,
    next_stream: FxHashMap<(ConnectionHandle, Dir), u64>,
    sockets: FxHashMap<EndpointHandle, UdpSocket>,
    files: Vec<Arc<File>>,
    pub(super) refuse_streams: bool,
    pub(super) fail_sessions: Option<EngineError>,
    pub(super) fail_endpoints: bool,
    pub(super) fail_file_sends: bool,
}

impl EngineState {
    fn connection(&mut self, side: Side) -> ConnectionHandle {
        let connection = ConnectionHandle(self.next_connection);
        self.next_connection += 1;
        self.sides.insert(connection, side);
        connection
    }
}

/// Records every call and allocates connections and stream ids like a real engine would
#[derive(Clone, Default)]
pub(super) struct TestEngine(Rc<RefCell<EngineState>>);

impl TestEngine {
    pub(super) fn state(&self) -> std::cell::RefMut<'_, EngineState> {
        self.0.borrow_mut()
    }

    pub(super) fn calls(&self) -> Vec<Call> {
        self.0.borrow().calls.clone()
    }

    pub(super) fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.0.borrow_mut().calls)
    }

    /// A connection the engine accepted on the server side
    pub(super) fn inbound(&self) -> ConnectionHandle {
        self.0.borrow_mut().connection(Side::Server)
    }

    pub(super) fn last_client(&self) -> Option<ConnectionHandle> {
        self.0.borrow().calls.iter().rev().find_map(|call| match *call {
            Call::CreateClient { connection, .. } => Some(connection),
            _ => None,
        })
    }

    pub(super) fn endpoint_addr(&self, endpoint: EndpointHandle) -> Option<SocketAddr> {
        self.0.borrow().sockets.get(&endpoint)?.local_addr().ok()
    }

    pub(super) fn file(&self, index: usize) -> Weak<File> {
        Arc::downgrade(&self.0.borrow().files[index])
    }

    /// Drop every file reference handed over through `send_file`
    pub(super) fn release_files(&self) {
        self.0.borrow_mut().files.clear();
    }

    fn next_completion(&self) -> Option<EngineEvent> {
        self.0.borrow_mut().completions.pop_front()
    }

    fn record(&self, call: Call) {
        self.0.borrow_mut().calls.push(call);
    }
}

impl TransportEngine for TestEngine {
    fn configure(&mut self, _: &SocketOptions) {
        self.record(Call::Configure);
    }

    fn add_endpoint(
        &mut self,
        endpoint: EndpointHandle,
        socket: UdpSocket,
        preferred: bool,
    ) -> Result<(), EngineError> {
        let mut state = self.0.borrow_mut();
        if state.fail_endpoints {
            return Err(EngineError::Refused);
        }
        state.sockets.insert(endpoint, socket);
        state.calls.push(Call::AddEndpoint {
            endpoint,
            preferred,
        });
        Ok(())
    }

    fn close_endpoint(&mut self, endpoint: EndpointHandle) {
        let mut state = self.0.borrow_mut();
        state.sockets.remove(&endpoint);
        state.calls.push(Call::CloseEndpoint(endpoint));
        state.completions.push_back(EngineEvent::EndpointClosed {
            endpoint,
            error: None,
        });
    }

    fn set_endpoint_ref(&mut self, endpoint: EndpointHandle, referenced: bool) {
        self.record(Call::SetEndpointRef(endpoint, referenced));
    }

    fn listen(&mut self, params: ListenParams) -> Result<(), EngineError> {
        self.record(Call::Listen {
            alpn: params.alpn,
            preferred_address: params.preferred_address,
        });
        Ok(())
    }

    fn stop_listening(&mut self) {
        self.record(Call::StopListening);
    }

    fn set_server_busy(&mut self, on: bool) {
        self.record(Call::ServerBusy(on));
    }

    fn set_stateless_reset_disabled(&mut self, on: bool) {
        self.record(Call::StatelessResetDisabled(on));
    }

    fn set_diagnostic_packet_loss(&mut self, rx: f64, tx: f64) {
        self.record(Call::PacketLoss(rx, tx));
    }

    fn create_client_session(
        &mut self,
        params: ClientSessionParams,
    ) -> Result<ConnectionHandle, EngineError> {
        let mut state = self.0.borrow_mut();
        if let Some(ref e) = state.fail_sessions {
            return Err(e.clone());
        }
        let connection = state.connection(Side::Client);
        state.calls.push(Call::CreateClient {
            connection,
            remote: params.remote,
            servername: params.servername,
            auto_start: params.auto_start,
        });
        Ok(connection)
    }

    fn start_handshake(&mut self, connection: ConnectionHandle) {
        self.record(Call::StartHandshake(connection));
    }

    fn client_hello_done(&mut self, connection: ConnectionHandle, context: Option<SecureContext>) {
        self.record(Call::ClientHelloDone(connection, context_name(context)));
    }

    fn certificate_done(
        &mut self,
        connection: ConnectionHandle,
        context: Option<SecureContext>,
        ocsp_response: Option<Bytes>,
    ) {
        self.record(Call::CertificateDone {
            connection,
            context: context_name(context),
            ocsp: ocsp_response,
        });
    }

    fn graceful_close(&mut self, connection: ConnectionHandle) {
        self.record(Call::GracefulClose(connection));
    }

    fn destroy_session(&mut self, connection: ConnectionHandle, close: CloseCode, silent: bool) {
        self.record(Call::DestroySession {
            connection,
            close,
            silent,
        });
    }

    fn ping(&mut self, connection: ConnectionHandle) {
        self.record(Call::Ping(connection));
    }

    fn update_key(&mut self, connection: ConnectionHandle) -> Result<(), EngineError> {
        self.record(Call::UpdateKey(connection));
        Ok(())
    }

    fn certificate(&self, _: ConnectionHandle) -> Option<Bytes> {
        Some(Bytes::from_static(b"local certificate"))
    }

    fn peer_certificate(&self, _: ConnectionHandle) -> Vec<Bytes> {
        vec![Bytes::from_static(b"peer certificate")]
    }

    fn open_stream(&mut self, connection: ConnectionHandle, dir: Dir) -> Option<StreamId> {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::OpenStream(connection, dir));
        if state.refuse_streams {
            return None;
        }
        let side = state.sides.get(&connection).copied().unwrap_or(Side::Client);
        let index = state.next_stream.entry((connection, dir)).or_default();
        let id = StreamId::new(side, dir, *index);
        *index += 1;
        Some(id)
    }

    fn write_stream(
        &mut self,
        _: ConnectionHandle,
        stream: StreamId,
        data: Bytes,
    ) -> Result<(), EngineError> {
        self.record(Call::Write(stream, data));
        Ok(())
    }

    fn shutdown_stream(
        &mut self,
        _: ConnectionHandle,
        stream: StreamId,
    ) -> Result<(), EngineError> {
        self.record(Call::Shutdown(stream));
        Ok(())
    }

    fn read_start(&mut self, _: ConnectionHandle, stream: StreamId) {
        self.record(Call::ReadStart(stream));
    }

    fn read_stop(&mut self, _: ConnectionHandle, stream: StreamId) {
        self.record(Call::ReadStop(stream));
    }

    fn reset_stream(
        &mut self,
        _: ConnectionHandle,
        stream: StreamId,
        code: CloseCode,
        directions: ResetDirections,
    ) {
        self.record(Call::Reset {
            stream,
            code,
            directions,
        });
    }

    fn submit_headers(
        &mut self,
        _: ConnectionHandle,
        stream: StreamId,
        kind: HeadersKind,
        headers: &[Header],
        terminal: bool,
    ) -> Result<(), EngineError> {
        self.record(Call::Headers {
            stream,
            kind,
            headers: headers.to_vec(),
            terminal,
        });
        Ok(())
    }

    fn send_file(
        &mut self,
        _: ConnectionHandle,
        stream: StreamId,
        file: Arc<File>,
        offset: Option<u64>,
        length: Option<u64>,
    ) -> Result<(), EngineError> {
        let mut state = self.0.borrow_mut();
        if state.fail_file_sends {
            return Err(EngineError::Refused);
        }
        state.files.push(file);
        state.calls.push(Call::SendFile {
            stream,
            offset,
            length,
        });
        Ok(())
    }

    fn destroy_stream(&mut self, _: ConnectionHandle, stream: StreamId) {
        self.record(Call::DestroyStream(stream));
    }
}

fn context_name(context: Option<SecureContext>) -> Option<String> {
    context.and_then(|c| c.downcast::<String>()).map(|name| (*name).clone())
}

#[derive(Default)]
pub(super) struct LookupState {
    pub(super) requests: Vec<(String, AddressFamily)>,
    pending: VecDeque<(LookupToken, String, AddressFamily)>,
    fail: Vec<String>,
}

/// Answers lookups only when the harness drives it
///
/// Literal addresses resolve to themselves and names to loopback, unless marked as failing.
#[derive(Clone, Default)]
pub(super) struct TestLookup(Rc<RefCell<LookupState>>);

impl TestLookup {
    pub(super) fn fail(&self, host: &str) {
        self.0.borrow_mut().fail.push(host.to_owned());
    }

    pub(super) fn requests(&self) -> Vec<(String, AddressFamily)> {
        self.0.borrow().requests.clone()
    }

    fn next_result(&self) -> Option<(LookupToken, io::Result<IpAddr>)> {
        let mut state = self.0.borrow_mut();
        let (token, host, family) = state.pending.pop_front()?;
        if state.fail.contains(&host) {
            let error = io::Error::new(io::ErrorKind::NotFound, format!("{host} not found"));
            return Some((token, Err(error)));
        }
        let ip = host.parse().unwrap_or(match family {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        });
        Some((token, Ok(ip)))
    }
}

impl Lookup for TestLookup {
    fn lookup(&mut self, token: LookupToken, host: &str, family: AddressFamily) {
        let mut state = self.0.borrow_mut();
        state.requests.push((host.to_owned(), family));
        state.pending.push_back((token, host.to_owned(), family));
    }
}

/// Builds contexts that only remember the ALPN they were built for
#[derive(Clone, Default)]
pub(super) struct TestTls;

impl TlsProvider for TestTls {
    fn server_context(&self, _: &TlsConfig, alpn: &str) -> Result<SecureContext, TlsError> {
        Ok(SecureContext::new(Side::Server, Arc::new(alpn.to_owned())))
    }

    fn client_context(&self, _: &TlsConfig, alpn: &str) -> Result<SecureContext, TlsError> {
        Ok(SecureContext::new(Side::Client, Arc::new(alpn.to_owned())))
    }
}

pub(super) fn named_context(name: &str) -> SecureContext {
    SecureContext::new(Side::Server, Arc::new(name.to_owned()))
}

pub(super) fn server_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.alpn(ALPN).unwrap();
    config
}

pub(super) fn client_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.address(SERVER_NAME).port(SERVER_PORT);
    config.alpn(ALPN).unwrap();
    config
}

pub(super) fn handshake_info() -> HandshakeInfo {
    HandshakeInfo {
        servername: SERVER_NAME.into(),
        alpn: ALPN.into(),
        cipher: CipherInfo {
            name: "TLS13_AES_128_GCM_SHA256".into(),
            version: "TLSv1.3".into(),
        },
        max_packet_length: 1200,
        ..HandshakeInfo::default()
    }
}

pub(super) fn remote() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 50_000)
}

/// A socket wired to the test collaborators, with every notification it produced so far
pub(super) struct Harness {
    pub(super) socket: Socket,
    pub(super) engine: TestEngine,
    pub(super) lookup: TestLookup,
    pub(super) events: Vec<Event>,
}

impl Harness {
    pub(super) fn new() -> Self {
        let mut endpoint = EndpointConfig::default();
        endpoint.address("127.0.0.1");
        let mut config = SocketConfig::default();
        config.endpoint(endpoint);
        Self::with_config(config)
    }

    pub(super) fn with_config(config: SocketConfig) -> Self {
        let engine = TestEngine::default();
        let lookup = TestLookup::default();
        let socket = Socket::new(config, engine.clone(), TestTls, lookup.clone()).unwrap();
        Self {
            socket,
            engine,
            lookup,
            events: Vec::new(),
        }
    }

    /// A bound socket that is listening with [`server_config`]
    pub(super) fn listening() -> Self {
        let mut h = Self::new();
        h.socket.listen(server_config()).unwrap();
        h.drive();
        h
    }

    /// Run lookups and engine completions until nothing is left to do
    pub(super) fn drive(&mut self) {
        loop {
            let mut progress = false;
            while let Some((token, result)) = self.lookup.next_result() {
                self.socket.handle_lookup(token, result);
                progress = true;
            }
            while let Some(event) = self.engine.next_completion() {
                self.socket.handle_event(event);
                progress = true;
            }
            while let Some(event) = self.socket.poll() {
                self.events.push(event);
                progress = true;
            }
            if !progress {
                break;
            }
        }
    }

    /// Feed an engine event and drive
    pub(super) fn engine_event(&mut self, event: EngineEvent) {
        self.socket.handle_event(event);
        self.drive();
    }

    /// Accept an inbound session
    pub(super) fn accept(&mut self) -> (SessionHandle, ConnectionHandle) {
        let connection = self.engine.inbound();
        self.engine_event(EngineEvent::NewSession {
            connection,
            remote: remote(),
        });
        let session = self
            .events
            .iter()
            .rev()
            .find_map(|e| match *e {
                Event::Socket(SocketEvent::Session(session)) => Some(session),
                _ => None,
            })
            .expect("session accepted");
        (session, connection)
    }

    /// Connect with [`client_config`] and wait for the engine to create the connection
    pub(super) fn connect(&mut self) -> (SessionHandle, ConnectionHandle) {
        self.connect_with(client_config())
    }

    pub(super) fn connect_with(
        &mut self,
        config: ClientConfig,
    ) -> (SessionHandle, ConnectionHandle) {
        let session = self.socket.connect(config).unwrap();
        self.drive();
        let connection = self.engine.last_client().expect("client connection");
        (session, connection)
    }

    pub(super) fn handshake(&mut self, connection: ConnectionHandle) {
        self.handshake_with(connection, handshake_info());
    }

    pub(super) fn handshake_with(&mut self, connection: ConnectionHandle, info: HandshakeInfo) {
        self.engine_event(EngineEvent::HandshakeComplete { connection, info });
    }

    /// Have the peer open a stream, returning its handle
    pub(super) fn peer_stream(
        &mut self,
        connection: ConnectionHandle,
        id: StreamId,
    ) -> StreamHandle {
        self.engine_event(EngineEvent::NewStream {
            connection,
            stream: id,
        });
        self.events
            .iter()
            .rev()
            .find_map(|e| match *e {
                Event::Session {
                    event: SessionEvent::Stream(stream),
                    ..
                } => Some(stream),
                _ => None,
            })
            .expect("peer stream")
    }

    pub(super) fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub(super) fn socket_events(&self) -> Vec<&SocketEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Socket(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub(super) fn session_events(&self, handle: SessionHandle) -> Vec<&SessionEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Session { session, event } if *session == handle => Some(event),
                _ => None,
            })
            .collect()
    }

    pub(super) fn stream_events(&self, handle: StreamHandle) -> Vec<&StreamEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Stream { stream, event } if *stream == handle => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Position of the first event matching `f`
    pub(super) fn index_of(&self, f: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events.iter().position(f)
    }
}

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
