use std::{
    collections::BTreeMap,
    fmt, io,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Once},
    time::Instant,
};

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::{
    config::{ClientConfig, ConfigError, EndpointConfig, ServerConfig, SocketConfig},
    endpoint::{EndpointInner, EndpointState},
    engine::{EngineEvent, ListenParams, TransportEngine},
    error::Error,
    event::{Callbacks, CloseCallback, Event, SocketEvent, Task, Tasks},
    lookup::{Lookup, LookupToken},
    session::SessionInner,
    stats::SocketStats,
    tls::{SecureContext, TlsProvider},
    ConnectionHandle, EndpointHandle, SessionHandle, StreamHandle, StreamId,
};

/// Lifecycle of a [`Socket`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketState {
    /// No endpoint has been asked to bind yet
    Unbound,
    /// Endpoints are resolving or binding
    Pending,
    /// At least one endpoint is bound
    Bound,
    /// The socket has been destroyed
    Destroyed,
}

/// What an outstanding lookup resolves for
#[derive(Debug, Copy, Clone)]
pub(crate) enum LookupPurpose {
    Bind(EndpointHandle),
    PreferredAddress,
    Connect(SessionHandle),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ListenPhase {
    Idle,
    Binding,
    Resolving,
    Listening,
}

#[derive(Debug)]
pub(crate) struct Listener {
    pub(crate) config: ServerConfig,
    pub(crate) context: SecureContext,
}

/// A QUIC connection multiplexer
///
/// A socket owns a set of UDP endpoints and every session using them. Server sessions are
/// accepted after [`listen`](Self::listen); client sessions are created by
/// [`connect`](Self::connect). Binding happens on demand: the first `listen` or `connect` binds
/// every endpoint, and sessions only become ready once at least one endpoint is bound.
///
/// Sessions and streams are reached through [`Socket::session`] and [`Socket::stream`].
/// Everything the socket has to report is queued and returned by [`Socket::poll`].
pub struct Socket {
    pub(crate) engine: Box<dyn TransportEngine>,
    tls: Box<dyn TlsProvider>,
    pub(crate) lookup: Box<dyn Lookup>,
    config: SocketConfig,
    pub(crate) state: SocketState,
    pub(crate) endpoints: BTreeMap<EndpointHandle, EndpointInner>,
    pub(crate) sessions: BTreeMap<SessionHandle, SessionInner>,
    pub(crate) connections: FxHashMap<ConnectionHandle, SessionHandle>,
    pub(crate) lookups: FxHashMap<LookupToken, LookupPurpose>,
    listen: ListenPhase,
    pub(crate) listener: Option<Listener>,
    bind_waiters: Vec<SessionHandle>,
    closing: bool,
    busy: bool,
    stateless_reset_disabled: bool,
    pub(crate) referenced: bool,
    destroy_error: Option<Error>,
    finished: bool,
    pub(crate) tasks: Tasks,
    pub(crate) callbacks: Callbacks,
    pub(crate) stats: SocketStats,
    next_id: u64,
}

impl Socket {
    /// Create a socket with its preferred endpoint
    ///
    /// Nothing is bound until the first [`listen`](Self::listen) or [`connect`](Self::connect).
    pub fn new(
        config: SocketConfig,
        engine: impl TransportEngine + 'static,
        tls: impl TlsProvider + 'static,
        lookup: impl Lookup + 'static,
    ) -> Result<Self, Error> {
        config.validate()?;
        let mut engine = Box::new(engine);
        engine.configure(&config.options);
        let endpoint = config.endpoint.clone();
        let mut socket = Self {
            engine,
            tls: Box::new(tls),
            lookup: Box::new(lookup),
            stateless_reset_disabled: config.options.disable_stateless_reset,
            config,
            state: SocketState::Unbound,
            endpoints: BTreeMap::new(),
            sessions: BTreeMap::new(),
            connections: FxHashMap::default(),
            lookups: FxHashMap::default(),
            listen: ListenPhase::Idle,
            listener: None,
            bind_waiters: Vec::new(),
            closing: false,
            busy: false,
            referenced: true,
            destroy_error: None,
            finished: false,
            tasks: Tasks::default(),
            callbacks: Callbacks::default(),
            stats: SocketStats::new(Instant::now()),
            next_id: 0,
        };
        socket.insert_endpoint(endpoint);
        Ok(socket)
    }

    /// Add another UDP binding
    ///
    /// The endpoint binds right away if the socket is already binding or bound.
    pub fn add_endpoint(&mut self, config: EndpointConfig) -> Result<EndpointHandle, Error> {
        if self.state == SocketState::Destroyed {
            return Err(Error::destroyed("Socket", "add_endpoint"));
        }
        config.validate()?;
        let handle = self.insert_endpoint(config);
        if matches!(self.state, SocketState::Pending | SocketState::Bound) {
            self.bind_endpoint(handle)?;
        }
        Ok(handle)
    }

    /// Start accepting inbound sessions
    ///
    /// Binds the socket if needed, resolves the preferred address if one is configured, and then
    /// asks the engine to listen. [`SocketEvent::Listening`] follows once that has happened.
    pub fn listen(&mut self, config: ServerConfig) -> Result<(), Error> {
        self.listen_inner(config, None)
    }

    /// Like [`listen`](Self::listen), calling `on_session` for every accepted session
    pub fn listen_with(
        &mut self,
        config: ServerConfig,
        on_session: impl FnMut(SessionHandle) + 'static,
    ) -> Result<(), Error> {
        self.listen_inner(config, Some(Box::new(on_session)))
    }

    fn listen_inner(
        &mut self,
        config: ServerConfig,
        on_session: Option<crate::event::SessionCallback>,
    ) -> Result<(), Error> {
        match self.state {
            SocketState::Destroyed => return Err(Error::destroyed("Socket", "listen")),
            _ if self.closing => return Err(Error::closing("Socket", "listen")),
            _ if self.listen != ListenPhase::Idle => {
                return Err(Error::InvalidState("socket is already listening"))
            }
            _ => {}
        }
        config.validate()?;
        let alpn = config
            .alpn
            .as_deref()
            .ok_or(ConfigError::IllegalValue("alpn is required"))?;
        let context = self.tls.server_context(&config.tls, alpn)?;

        self.maybe_bind();
        if let Some(cb) = on_session {
            self.callbacks.on_session(cb);
        }
        self.listener = Some(Listener { config, context });
        self.listen = ListenPhase::Binding;
        if self.state == SocketState::Bound {
            self.listen_bound();
        }
        Ok(())
    }

    /// Create a client session
    ///
    /// The session is registered immediately; it becomes ready once the socket is bound, the
    /// server address is resolved, and the engine has created the connection.
    pub fn connect(&mut self, config: ClientConfig) -> Result<SessionHandle, Error> {
        self.connect_inner(config, None)
    }

    /// Like [`connect`](Self::connect), calling `on_ready` once the session is ready
    pub fn connect_with(
        &mut self,
        config: ClientConfig,
        on_ready: impl FnOnce(SessionHandle) + 'static,
    ) -> Result<SessionHandle, Error> {
        self.connect_inner(config, Some(Box::new(on_ready)))
    }

    fn connect_inner(
        &mut self,
        config: ClientConfig,
        on_ready: Option<crate::event::ReadyCallback>,
    ) -> Result<SessionHandle, Error> {
        if self.state == SocketState::Destroyed {
            return Err(Error::destroyed("Socket", "connect"));
        }
        if self.closing {
            return Err(Error::closing("Socket", "connect"));
        }
        config.validate()?;
        let alpn = config
            .alpn
            .as_deref()
            .ok_or(ConfigError::IllegalValue("alpn is required"))?;
        let context = self.tls.client_context(&config.tls, alpn)?;
        if !config.verify_hostname_identity {
            static HOSTNAME_WARNING: Once = Once::new();
            HOSTNAME_WARNING.call_once(|| {
                warn!("hostname identity verification is disabled; this is insecure")
            });
        }

        let handle = SessionHandle(self.alloc_id());
        self.sessions
            .insert(handle, SessionInner::client(config, context, Instant::now()));
        self.stats.client_sessions += 1;
        if let Some(cb) = on_ready {
            self.callbacks.on_ready(handle, cb);
        }
        debug!(session = ?handle, "client session created");

        self.maybe_bind();
        match self.state {
            SocketState::Bound => self.resolve_remote(handle),
            _ => self.bind_waiters.push(handle),
        }
        Ok(handle)
    }

    /// Gracefully close the socket
    ///
    /// Stops accepting sessions and gracefully closes every session; the socket is destroyed
    /// once the last of them is gone. Calling this again while closing has no further effect.
    pub fn close(&mut self) -> Result<(), Error> {
        self.close_inner(None)
    }

    /// Like [`close`](Self::close), calling `on_close` once the socket is gone
    pub fn close_with(
        &mut self,
        on_close: impl FnOnce(Option<&Error>) + 'static,
    ) -> Result<(), Error> {
        self.close_inner(Some(Box::new(on_close)))
    }

    fn close_inner(&mut self, on_close: Option<CloseCallback>) -> Result<(), Error> {
        if self.state == SocketState::Destroyed {
            return Err(Error::destroyed("Socket", "close"));
        }
        if let Some(cb) = on_close {
            self.callbacks.on_socket_close(cb);
        }
        if self.closing {
            return Ok(());
        }
        self.closing = true;
        self.stop_listening();

        if self.state != SocketState::Bound || self.sessions.is_empty() {
            self.destroy(None);
            return Ok(());
        }
        debug!(sessions = self.sessions.len(), "closing socket");
        let sessions = self.sessions.keys().copied().collect::<Vec<_>>();
        for session in sessions {
            self.graceful_close_session(session);
        }
        Ok(())
    }

    /// Destroy the socket immediately
    ///
    /// Every session is destroyed with `error`, then every endpoint is closed. The
    /// [`SocketEvent::Close`] notification follows once the last endpoint has closed.
    pub fn destroy(&mut self, error: Option<Error>) {
        if self.state == SocketState::Destroyed {
            return;
        }
        debug!(?error, "destroying socket");
        self.state = SocketState::Destroyed;
        self.stats.destroyed_at = Some(Instant::now());
        self.stats.engine = self.engine.socket_stats();
        self.stop_listening();
        self.listener = None;
        self.bind_waiters.clear();
        self.destroy_error = error.clone();

        let sessions = self.sessions.keys().copied().collect::<Vec<_>>();
        for session in sessions {
            self.destroy_session(session, error.clone(), None);
        }

        let endpoints = self.endpoints.keys().copied().collect::<Vec<_>>();
        if endpoints.is_empty() {
            self.finish_destroy();
            return;
        }
        for endpoint in endpoints {
            self.destroy_endpoint(endpoint, None);
        }
    }

    /// Refuse new sessions while `on`, without affecting existing ones
    pub fn set_server_busy(&mut self, on: bool) -> Result<(), Error> {
        if self.state == SocketState::Destroyed {
            return Err(Error::destroyed("Socket", "set_server_busy"));
        }
        if self.busy != on {
            self.engine.set_server_busy(on);
            self.busy_changed(on);
        }
        Ok(())
    }

    /// Randomly drop a fraction of received (`rx`) and transmitted (`tx`) packets
    ///
    /// Both probabilities must lie in `0.0..=1.0`. Only meant for testing.
    pub fn set_diagnostic_packet_loss(&mut self, rx: f64, tx: f64) -> Result<(), Error> {
        if self.state == SocketState::Destroyed {
            return Err(Error::destroyed("Socket", "set_diagnostic_packet_loss"));
        }
        if !(0.0..=1.0).contains(&rx) || !(0.0..=1.0).contains(&tx) {
            return Err(ConfigError::OutOfBounds.into());
        }
        static PACKET_LOSS_WARNING: Once = Once::new();
        PACKET_LOSS_WARNING.call_once(|| {
            warn!("diagnostic packet loss is enabled; this should only be used for testing")
        });
        self.engine.set_diagnostic_packet_loss(rx, tx);
        Ok(())
    }

    /// Stop answering unknown packets with stateless resets while `on`
    pub fn set_stateless_reset_disabled(&mut self, on: bool) -> Result<(), Error> {
        if self.state == SocketState::Destroyed {
            return Err(Error::destroyed("Socket", "set_stateless_reset_disabled"));
        }
        if self.stateless_reset_disabled != on {
            self.stateless_reset_disabled = on;
            self.engine.set_stateless_reset_disabled(on);
        }
        Ok(())
    }

    /// Whether the socket's endpoints keep the surrounding event loop alive
    ///
    /// An unreferenced socket lets a [`Driver`](crate::Driver) stop once nothing is queued.
    pub fn set_ref(&mut self, referenced: bool) -> Result<(), Error> {
        if self.state == SocketState::Destroyed {
            return Err(Error::destroyed("Socket", "set_ref"));
        }
        self.referenced = referenced;
        for (&handle, endpoint) in &self.endpoints {
            if endpoint.attached {
                self.engine.set_endpoint_ref(handle, referenced);
            }
        }
        Ok(())
    }

    /// Feed a completion from the transport engine into the socket
    pub fn handle_event(&mut self, event: EngineEvent) {
        use EngineEvent::*;
        match event {
            SocketError { error } => {
                warn!(%error, "socket error reported by the engine");
                self.destroy(Some(error.into()));
            }
            EndpointClosed { endpoint, error } => {
                self.endpoint_closed(endpoint, error.map(|e| Error::Io(Arc::new(e))))
            }
            ServerBusy { on } => self.busy_changed(on),
            NewSession { connection, remote } => self.accept_session(connection, remote),
            ClientHello {
                connection,
                alpn,
                servername,
                ciphers,
            } => {
                if let Some(session) = self.route(connection) {
                    self.session_client_hello(session, alpn, servername, ciphers);
                }
            }
            CertificateRequest {
                connection,
                servername,
            } => {
                if let Some(session) = self.route(connection) {
                    self.session_certificate_request(session, servername);
                }
            }
            OcspResponse {
                connection,
                response,
            } => {
                if let Some(session) = self.route(connection) {
                    self.session_ocsp_response(session, response);
                }
            }
            HandshakeComplete { connection, info } => {
                if let Some(session) = self.route(connection) {
                    self.session_handshake(session, info);
                }
            }
            HandshakeConfirmed { connection } => {
                if let Some(session) = self.route(connection) {
                    self.session_handshake_confirmed(session);
                }
            }
            SessionClosed {
                connection,
                close,
                silent,
                stateless_reset,
            } => {
                if let Some(session) = self.route(connection) {
                    self.session_closed_by_engine(session, close, silent, stateless_reset);
                }
            }
            VersionNegotiation {
                connection,
                version,
                requested,
                supported,
            } => {
                if let Some(session) = self.route(connection) {
                    let error = Error::VersionNegotiation {
                        version,
                        requested,
                        supported,
                    };
                    self.destroy_session(session, Some(error), None);
                }
            }
            SessionTicket {
                connection,
                ticket,
                transport_params,
            } => self.session_notify(
                connection,
                crate::SessionEvent::SessionTicket {
                    ticket,
                    transport_params,
                },
            ),
            PathValidation {
                connection,
                result,
                local,
                remote,
            } => self.session_notify(
                connection,
                crate::SessionEvent::PathValidation {
                    result,
                    local,
                    remote,
                },
            ),
            UsePreferredAddress {
                connection,
                address,
            } => {
                if let Some(session) = self.route(connection) {
                    if let Some(inner) = self.sessions.get_mut(&session) {
                        inner.remote = Some(address);
                    }
                    self.tasks
                        .session(session, crate::SessionEvent::UsePreferredAddress(address));
                }
            }
            Qlog { connection, record } => {
                self.session_notify(connection, crate::SessionEvent::Qlog(record))
            }
            Keylog { connection, line } => {
                self.session_notify(connection, crate::SessionEvent::Keylog(line))
            }
            NewStream { connection, stream } => {
                if let Some(session) = self.route(connection) {
                    self.accept_stream(session, stream);
                }
            }
            StreamData {
                connection,
                stream,
                data,
                fin,
            } => {
                if let Some(handle) = self.route_stream(connection, stream) {
                    self.stream_data(handle, data, fin);
                }
            }
            StreamAcked {
                connection,
                stream,
                bytes,
            } => {
                if let Some(handle) = self.route_stream(connection, stream) {
                    self.stream_acked(handle, bytes);
                }
            }
            StreamBlocked { connection, stream } => {
                if let Some(handle) = self.route_stream(connection, stream) {
                    self.tasks.stream(handle, crate::StreamEvent::Blocked);
                }
            }
            StreamReset {
                connection,
                stream,
                code,
                final_size,
            } => {
                if let Some(handle) = self.route_stream(connection, stream) {
                    self.stream_reset(handle, code, final_size);
                }
            }
            StreamClosed {
                connection,
                stream,
                code,
            } => {
                if let Some(handle) = self.route_stream(connection, stream) {
                    trace!(%stream, code, "stream closed by the engine");
                    self.destroy_stream(handle, None);
                }
            }
            StreamError {
                connection,
                stream,
                error,
            } => {
                if let Some(handle) = self.route_stream(connection, stream) {
                    self.destroy_stream(handle, Some(error.into()));
                }
            }
            StreamHeaders {
                connection,
                stream,
                kind,
                headers,
            } => {
                if let Some(handle) = self.route_stream(connection, stream) {
                    self.tasks
                        .stream(handle, crate::StreamEvent::Headers { kind, headers });
                }
            }
            StreamFileDone {
                connection,
                stream,
                result,
            } => {
                if let Some(handle) = self.route_stream(connection, stream) {
                    self.stream_file_done(handle, result);
                }
            }
        }
    }

    /// Feed the result of a [`Lookup`] into the socket
    ///
    /// Results for objects destroyed in the meantime are dropped.
    pub fn handle_lookup(&mut self, token: LookupToken, result: io::Result<IpAddr>) {
        let Some(purpose) = self.lookups.remove(&token) else {
            trace!(?token, "dropping stale lookup result");
            return;
        };
        match purpose {
            LookupPurpose::Bind(endpoint) => self.endpoint_resolved(endpoint, token, result),
            LookupPurpose::PreferredAddress => self.preferred_address_resolved(result),
            LookupPurpose::Connect(session) => self.remote_resolved(session, token, result),
        }
    }

    /// Get the next notification, if any
    ///
    /// Notifications come out in the order they were scheduled. Callbacks registered through
    /// `listen_with`, `connect_with` and `close_with` run here, just before their event is
    /// returned.
    #[must_use]
    pub fn poll(&mut self) -> Option<Event> {
        while let Some(task) = self.tasks.pop() {
            match task {
                Task::Emit(event) => {
                    self.callbacks.dispatch(&event);
                    return Some(event);
                }
                Task::EndpointClosed { endpoint, error } => self.endpoint_closed(endpoint, error),
            }
        }
        None
    }

    /// Lifecycle state
    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Whether the engine is accepting inbound sessions
    pub fn is_listening(&self) -> bool {
        self.listen == ListenPhase::Listening
    }

    /// Whether new sessions are being refused
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Whether the socket has been destroyed
    pub fn is_destroyed(&self) -> bool {
        self.state == SocketState::Destroyed
    }

    /// Whether stateless resets are currently disabled
    pub fn is_stateless_reset_disabled(&self) -> bool {
        self.stateless_reset_disabled
    }

    /// Whether the socket keeps the event loop alive
    pub fn is_ref(&self) -> bool {
        self.referenced
    }

    /// Whether the socket is destroyed and has nothing left to report
    pub fn is_finished(&self) -> bool {
        self.finished && self.tasks.is_empty()
    }

    /// Whether nothing is queued and no lookup is outstanding
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.lookups.is_empty()
    }

    /// The server context built by [`listen`](Self::listen)
    pub fn secure_context(&self) -> Option<&SecureContext> {
        self.listener.as_ref().map(|l| &l.context)
    }

    /// The socket's default server configuration, as a starting point for `listen`
    pub fn server_defaults(&self) -> ServerConfig {
        self.config.server.clone()
    }

    /// The socket's default client configuration, as a starting point for `connect`
    pub fn client_defaults(&self) -> ClientConfig {
        self.config.client.clone()
    }

    /// Endpoints that have not finished closing
    pub fn endpoints(&self) -> impl Iterator<Item = EndpointHandle> + '_ {
        self.endpoints.keys().copied()
    }

    /// Sessions that have not been destroyed
    pub fn sessions(&self) -> impl Iterator<Item = SessionHandle> + '_ {
        self.sessions.keys().copied()
    }

    /// Statistics, including a fresh snapshot of the engine's counters
    pub fn stats(&self) -> SocketStats {
        let mut stats = self.stats;
        if self.state != SocketState::Destroyed {
            stats.engine = self.engine.socket_stats();
        }
        stats
    }

    pub(crate) fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn alloc_lookup(&mut self, purpose: LookupPurpose) -> LookupToken {
        let token = LookupToken(self.alloc_id());
        self.lookups.insert(token, purpose);
        token
    }

    /// Put every endpoint into `Pending` the first time the socket needs to be bound
    ///
    /// Endpoints closed before this point are skipped; their pending close settles the socket.
    fn maybe_bind(&mut self) {
        if self.state != SocketState::Unbound {
            return;
        }
        self.state = SocketState::Pending;
        let endpoints = self
            .endpoints
            .iter()
            .filter(|(_, e)| e.state == EndpointState::Unbound)
            .map(|(&h, _)| h)
            .collect::<Vec<_>>();
        for endpoint in endpoints {
            if let Err(error) = self.bind_endpoint(endpoint) {
                trace!(?endpoint, %error, "skipping endpoint");
            }
        }
    }

    /// Called by each endpoint once it is bound
    pub(crate) fn endpoint_bound(&mut self) {
        if self.state != SocketState::Pending {
            return;
        }
        self.state = SocketState::Bound;
        self.stats.bound_at = Some(Instant::now());
        debug!("socket bound");
        self.tasks.socket(SocketEvent::Ready);

        self.listen_bound();
        for session in std::mem::take(&mut self.bind_waiters) {
            self.resolve_remote(session);
        }
    }

    /// Called by each endpoint once it has fully closed
    pub(crate) fn endpoint_closed(&mut self, handle: EndpointHandle, error: Option<Error>) {
        let Some(endpoint) = self.endpoints.remove(&handle) else {
            return;
        };
        let error = error.or(endpoint.error);
        debug!(endpoint = ?handle, ?error, "endpoint closed");
        self.tasks.socket(SocketEvent::EndpointClose {
            endpoint: handle,
            error: error.clone(),
        });

        // A bound socket stays bound until its last endpoint is gone
        if self.endpoints.is_empty() {
            match self.state {
                SocketState::Destroyed => self.finish_destroy(),
                _ => self.destroy(error),
            }
        }
    }

    /// Called whenever a session leaves the session set
    pub(crate) fn session_removed(&mut self) {
        if self.closing && self.sessions.is_empty() && self.state != SocketState::Destroyed {
            self.destroy(None);
        }
    }

    fn listen_bound(&mut self) {
        if self.listen != ListenPhase::Binding {
            return;
        }
        let preferred = self
            .listener
            .as_ref()
            .and_then(|l| l.config.preferred_address.clone());
        match preferred {
            Some(preferred) => {
                self.listen = ListenPhase::Resolving;
                let token = self.alloc_lookup(LookupPurpose::PreferredAddress);
                self.lookup.lookup(token, &preferred.host, preferred.family);
            }
            None => self.start_listening(None),
        }
    }

    fn preferred_address_resolved(&mut self, result: io::Result<IpAddr>) {
        if self.listen != ListenPhase::Resolving {
            return;
        }
        let Some(preferred) = self
            .listener
            .as_ref()
            .and_then(|l| l.config.preferred_address.clone())
        else {
            return;
        };
        match result {
            Ok(ip) => self.start_listening(Some(SocketAddr::new(ip, preferred.port))),
            Err(e) => self.destroy(Some(Error::Lookup {
                host: preferred.host,
                source: Arc::new(e),
            })),
        }
    }

    fn start_listening(&mut self, preferred_address: Option<SocketAddr>) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        let Some(alpn) = listener.config.alpn.clone() else {
            return;
        };
        let params = ListenParams {
            context: listener.context.clone(),
            alpn,
            preferred_address,
            transport: listener.config.transport.clone(),
            client_hello: listener.config.client_hello,
            ocsp: listener.config.ocsp,
            request_cert: listener.config.request_cert,
            reject_unauthorized: listener.config.reject_unauthorized,
        };
        if let Err(e) = self.engine.listen(params) {
            self.destroy(Some(e.into()));
            return;
        }
        self.listen = ListenPhase::Listening;
        self.stats.listen_at = Some(Instant::now());
        debug!("listening");
        self.tasks.socket(SocketEvent::Listening);
    }

    fn stop_listening(&mut self) {
        if self.listen == ListenPhase::Listening {
            self.engine.stop_listening();
        }
        self.listen = ListenPhase::Idle;
    }

    fn busy_changed(&mut self, on: bool) {
        if self.busy == on {
            return;
        }
        self.busy = on;
        if on {
            self.stats.server_busy_count += 1;
        }
        self.tasks.socket(SocketEvent::Busy(on));
    }

    fn finish_destroy(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(error) = self.destroy_error.clone() {
            self.tasks.socket(SocketEvent::Error(error));
        }
        self.tasks.socket(SocketEvent::Close { stats: self.stats });
        debug!("socket destroyed");
    }

    pub(crate) fn accepting_sessions(&self) -> bool {
        self.state == SocketState::Bound && self.listen == ListenPhase::Listening && !self.closing
    }

    fn route(&self, connection: ConnectionHandle) -> Option<SessionHandle> {
        let session = self.connections.get(&connection).copied();
        if session.is_none() {
            trace!(?connection, "dropping event for unknown connection");
        }
        session
    }

    fn route_stream(&self, connection: ConnectionHandle, id: StreamId) -> Option<StreamHandle> {
        let session = self.route(connection)?;
        let key = self.sessions.get(&session)?.ids.get(&id).copied();
        if key.is_none() {
            trace!(stream = %id, "dropping event for unknown stream");
        }
        Some(StreamHandle { session, key: key? })
    }

    fn session_notify(&mut self, connection: ConnectionHandle, event: crate::SessionEvent) {
        if let Some(session) = self.route(connection) {
            self.tasks.session(session, event);
        }
    }

    fn insert_endpoint(&mut self, config: EndpointConfig) -> EndpointHandle {
        let handle = EndpointHandle(self.alloc_id());
        self.endpoints.insert(handle, EndpointInner::new(config));
        handle
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("state", &self.state)
            .field("listen", &self.listen)
            .field("closing", &self.closing)
            .field("busy", &self.busy)
            .field("endpoints", &self.endpoints.len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
