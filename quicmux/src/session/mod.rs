use std::{
    collections::BTreeMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{
    config::StreamConfig,
    engine::{CipherInfo, HandshakeInfo, KeyExchange, VerifyError},
    error::Error,
    event::SessionEvent,
    socket::Socket,
    stats::SessionStats,
    stream::StreamInner,
    CloseCode, ConnectionHandle, Dir, SessionHandle, Side, StreamHandle, StreamId,
};

mod client;
mod server;

pub(crate) use client::ClientState;
pub(crate) use server::ServerState;

/// Lifecycle of a [`Session`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionPhase {
    /// A client session waiting for the socket to bind and the server address to resolve
    Initializing,
    /// The engine owns a connection and the TLS handshake is in progress
    Handshaking,
    /// The handshake completed
    Secure,
    /// Gracefully closing; no new streams are accepted
    Closing,
    /// Gone
    Destroyed,
}

#[derive(Debug)]
pub(crate) enum SessionKind {
    Client(ClientState),
    Server(ServerState),
}

#[derive(Debug)]
pub(crate) struct SessionInner {
    pub(crate) side: Side,
    /// Progress of the handshake; `Closing` and `Destroyed` are derived from the flags below
    pub(crate) phase: SessionPhase,
    pub(crate) closing: bool,
    /// Set while `destroy_session` runs so that nested teardown does not recurse
    pub(crate) destroyed: bool,
    pub(crate) connection: Option<ConnectionHandle>,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) servername: Option<String>,
    pub(crate) handshake: Option<HandshakeInfo>,
    pub(crate) handshake_confirmed: bool,
    pub(crate) close: CloseCode,
    pub(crate) silent_close: bool,
    pub(crate) stateless_reset: bool,
    pub(crate) streams: BTreeMap<u64, StreamInner>,
    pub(crate) ids: FxHashMap<StreamId, u64>,
    next_stream: u64,
    pub(crate) stream_hwm: usize,
    pub(crate) stats: SessionStats,
    pub(crate) kind: SessionKind,
}

impl SessionInner {
    fn new(side: Side, kind: SessionKind, stream_hwm: usize, now: Instant) -> Self {
        Self {
            side,
            phase: SessionPhase::Initializing,
            closing: false,
            destroyed: false,
            connection: None,
            remote: None,
            servername: None,
            handshake: None,
            handshake_confirmed: false,
            close: CloseCode::NO_ERROR,
            silent_close: false,
            stateless_reset: false,
            streams: BTreeMap::new(),
            ids: FxHashMap::default(),
            next_stream: 0,
            stream_hwm,
            stats: SessionStats::new(now),
            kind,
        }
    }

    pub(crate) fn insert_stream(&mut self, stream: StreamInner) -> u64 {
        let key = self.next_stream;
        self.next_stream += 1;
        self.streams.insert(key, stream);
        key
    }

    fn phase(&self) -> SessionPhase {
        match self.closing {
            true => SessionPhase::Closing,
            false => self.phase,
        }
    }
}

fn live<'s>(
    sessions: &'s BTreeMap<SessionHandle, SessionInner>,
    handle: SessionHandle,
    op: &'static str,
) -> Result<&'s SessionInner, Error> {
    sessions
        .get(&handle)
        .filter(|s| !s.destroyed)
        .ok_or(Error::destroyed("Session", op))
}

pub(crate) fn live_mut<'s>(
    sessions: &'s mut BTreeMap<SessionHandle, SessionInner>,
    handle: SessionHandle,
    op: &'static str,
) -> Result<&'s mut SessionInner, Error> {
    sessions
        .get_mut(&handle)
        .filter(|s| !s.destroyed)
        .ok_or(Error::destroyed("Session", op))
}

impl Socket {
    /// Access a session
    pub fn session(&mut self, handle: SessionHandle) -> Session<'_> {
        Session {
            socket: self,
            handle,
        }
    }

    /// Tear a session down immediately
    ///
    /// Every stream is destroyed first, open ones after being aborted with the close code. The
    /// engine is then told to send CONNECTION_CLOSE and forget the connection, and finally the
    /// session's `Error` (if any) and `Close` notifications are queued.
    pub(crate) fn destroy_session(
        &mut self,
        handle: SessionHandle,
        error: Option<Error>,
        code: Option<CloseCode>,
    ) {
        let Some(session) = self.sessions.get_mut(&handle) else {
            return;
        };
        if session.destroyed {
            return;
        }
        session.destroyed = true;
        if let Some(code) = code {
            session.close = code;
        } else if let Some(code) = error.as_ref().and_then(Error::close_code) {
            session.close = code;
        }
        let close = session.close;
        let error = error.or_else(|| code.filter(|c| c.code != 0).map(Error::Closed));
        debug!(session = ?handle, ?error, %close, "destroying session");

        let streams = session
            .streams
            .iter()
            .map(|(&key, s)| (key, s.id.is_some()))
            .collect::<Vec<_>>();
        for (key, open) in streams {
            let stream = StreamHandle {
                session: handle,
                key,
            };
            match open {
                true => {
                    self.abort_stream(stream, close);
                    self.destroy_stream(stream, error.clone());
                }
                false => {
                    let error = error.clone().unwrap_or(Error::StreamOpenAborted);
                    self.destroy_stream(stream, Some(error));
                }
            }
        }

        let Some(mut session) = self.sessions.remove(&handle) else {
            return;
        };
        if let Some(connection) = session.connection.take() {
            session.stats.engine = self.engine.session_stats(connection);
            self.engine
                .destroy_session(connection, close, session.silent_close);
            self.connections.remove(&connection);
        }
        if let SessionKind::Client(ref mut client) = session.kind {
            if let Some(token) = client.lookup.take() {
                self.lookups.remove(&token);
            }
        }
        session.stats.destroyed_at = Some(Instant::now());

        if let Some(error) = error {
            self.tasks.session(handle, SessionEvent::Error(error));
        }
        self.tasks.session(
            handle,
            SessionEvent::Close {
                code: close,
                silent: session.silent_close,
                stateless_reset: session.stateless_reset,
                stats: session.stats,
            },
        );
        self.session_removed();
    }

    /// Stop accepting streams and destroy the session once its existing streams are gone
    pub(crate) fn graceful_close_session(&mut self, handle: SessionHandle) {
        let Some(session) = self.sessions.get_mut(&handle) else {
            return;
        };
        if session.destroyed || session.closing {
            return;
        }
        session.closing = true;
        debug!(session = ?handle, streams = session.streams.len(), "closing session");

        // Streams still waiting for the handshake will never be opened
        let pending = session
            .streams
            .iter()
            .filter(|(_, s)| s.id.is_none())
            .map(|(&key, _)| key)
            .collect::<Vec<_>>();
        for key in pending {
            let stream = StreamHandle {
                session: handle,
                key,
            };
            self.destroy_stream(stream, Some(Error::StreamOpenAborted));
        }

        let Some(session) = self.sessions.get(&handle) else {
            return;
        };
        if session.streams.is_empty() {
            self.destroy_session(handle, None, None);
        } else if let Some(connection) = session.connection {
            self.engine.graceful_close(connection);
        }
    }

    /// Finish a graceful close once the last stream is gone
    pub(crate) fn maybe_destroy_session(&mut self, handle: SessionHandle) {
        let Some(session) = self.sessions.get(&handle) else {
            return;
        };
        if session.closing && !session.destroyed && session.streams.is_empty() {
            self.destroy_session(handle, None, None);
        }
    }

    pub(crate) fn session_closed_by_engine(
        &mut self,
        handle: SessionHandle,
        close: CloseCode,
        silent: bool,
        stateless_reset: bool,
    ) {
        let Some(session) = self.sessions.get_mut(&handle) else {
            return;
        };
        session.silent_close = silent;
        session.stateless_reset = stateless_reset;
        if let Some(connection) = session.connection.take() {
            session.stats.engine = self.engine.session_stats(connection);
            self.connections.remove(&connection);
        }
        trace!(session = ?handle, %close, silent, stateless_reset, "session closed by the engine");
        self.destroy_session(handle, None, Some(close));
    }

    pub(crate) fn session_handshake(&mut self, handle: SessionHandle, info: HandshakeInfo) {
        let Some(session) = self.sessions.get_mut(&handle) else {
            return;
        };
        if session.destroyed {
            return;
        }
        session.phase = SessionPhase::Secure;
        session.stats.handshake_completed_at = Some(Instant::now());
        if !info.servername.is_empty() {
            session.servername = Some(info.servername.clone());
        }

        if let SessionKind::Client(ref client) = session.kind {
            if let Some(ref key) = info.ephemeral_key {
                let min = client.config.min_dh_size;
                if key.kind == KeyExchange::Dh && key.size < min {
                    let size = key.size;
                    session.handshake = Some(info);
                    debug!(session = ?handle, size, min, "rejecting small DH parameters");
                    self.destroy_session(handle, Some(Error::DhParamSize { size, min }), None);
                    return;
                }
            }
        }

        debug!(
            session = ?handle,
            alpn = %info.alpn,
            cipher = %info.cipher.name,
            "handshake complete"
        );
        let event = SessionEvent::Secure {
            servername: info.servername.clone(),
            alpn: info.alpn.clone(),
            cipher: info.cipher.clone(),
        };
        session.handshake = Some(info);
        self.tasks.session(handle, event);
        self.open_pending_streams(handle);
    }

    pub(crate) fn session_handshake_confirmed(&mut self, handle: SessionHandle) {
        if let Some(session) = self.sessions.get_mut(&handle) {
            session.handshake_confirmed = true;
            session.stats.handshake_confirmed_at = Some(Instant::now());
        }
    }

    /// Allocate the streams requested before the handshake completed
    fn open_pending_streams(&mut self, handle: SessionHandle) {
        let Some(session) = self.sessions.get(&handle) else {
            return;
        };
        let pending = session
            .streams
            .iter()
            .filter(|(_, s)| s.id.is_none())
            .map(|(&key, _)| key)
            .collect::<Vec<_>>();
        for key in pending {
            let stream = StreamHandle {
                session: handle,
                key,
            };
            match self.allocate_stream(stream) {
                Some(id) => self.attach_stream(stream, id),
                None => self.destroy_stream(stream, Some(Error::StreamOpenRefused)),
            }
        }
    }

    /// Ask the engine for a stream id matching the stream's direction
    fn allocate_stream(&mut self, handle: StreamHandle) -> Option<StreamId> {
        let session = self.sessions.get(&handle.session)?;
        let connection = session.connection?;
        let dir = session.streams.get(&handle.key)?.dir;
        self.engine.open_stream(connection, dir)
    }
}

/// A QUIC session owned by a [`Socket`]
///
/// Obtained from [`Socket::session`]. Every operation fails with [`Error::Destroyed`] once the
/// session is gone.
#[derive(Debug)]
pub struct Session<'a> {
    pub(crate) socket: &'a mut Socket,
    pub(crate) handle: SessionHandle,
}

impl Session<'_> {
    /// The session's handle
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Which side of the connection we are
    pub fn side(&self) -> Option<Side> {
        self.inner().map(|s| s.side)
    }

    /// Lifecycle phase
    pub fn phase(&self) -> SessionPhase {
        match self.inner() {
            Some(s) if !s.destroyed => s.phase(),
            _ => SessionPhase::Destroyed,
        }
    }

    /// Whether a graceful close is in progress
    pub fn is_closing(&self) -> bool {
        self.inner().is_some_and(|s| s.closing)
    }

    /// Whether the session is gone
    pub fn is_destroyed(&self) -> bool {
        self.phase() == SessionPhase::Destroyed
    }

    /// Open a stream
    ///
    /// Before the handshake completes the stream is only reserved: writes are queued and the
    /// engine allocates it once the session is secure, after which
    /// [`StreamEvent::Ready`](crate::StreamEvent::Ready) fires. If the session is closed or
    /// destroyed first, the reserved stream reports an error and closes.
    pub fn open_stream(&mut self, config: StreamConfig) -> Result<StreamHandle, Error> {
        let session = live_mut(&mut self.socket.sessions, self.handle, "open_stream")?;
        if session.closing {
            return Err(Error::closing("Session", "open_stream"));
        }
        let dir = match config.half_open {
            true => Dir::Uni,
            false => Dir::Bi,
        };
        let hwm = config.high_water_mark.unwrap_or(session.stream_hwm);
        let stream = StreamInner::local(session.side, dir, hwm, Instant::now());
        let ready = session.phase == SessionPhase::Secure && session.connection.is_some();
        let handle = StreamHandle {
            session: self.handle,
            key: session.insert_stream(stream),
        };
        trace!(session = ?self.handle, %dir, ready, "opening stream");
        if !ready {
            return Ok(handle);
        }

        match self.socket.allocate_stream(handle) {
            Some(id) => {
                self.socket.attach_stream(handle, id);
                Ok(handle)
            }
            None => {
                if let Some(session) = self.socket.sessions.get_mut(&self.handle) {
                    session.streams.remove(&handle.key);
                }
                Err(Error::StreamOpenRefused)
            }
        }
    }

    /// Gracefully close the session
    ///
    /// Existing streams finish normally; the session is destroyed, sending CONNECTION_CLOSE,
    /// once the last of them is gone. New streams are refused from now on.
    pub fn close(&mut self) -> Result<(), Error> {
        live(&self.socket.sessions, self.handle, "close")?;
        self.socket.graceful_close_session(self.handle);
        Ok(())
    }

    /// Like [`close`](Self::close), calling `on_close` once the session is gone
    pub fn close_with(
        &mut self,
        on_close: impl FnOnce(Option<&Error>) + 'static,
    ) -> Result<(), Error> {
        live(&self.socket.sessions, self.handle, "close")?;
        self.socket
            .callbacks
            .on_session_close(self.handle, Box::new(on_close));
        self.socket.graceful_close_session(self.handle);
        Ok(())
    }

    /// Destroy the session immediately, abandoning its streams
    pub fn destroy(&mut self, error: Option<Error>) {
        self.socket.destroy_session(self.handle, error, None);
    }

    /// Destroy the session immediately, sending `code` in CONNECTION_CLOSE
    ///
    /// A non-zero code is reported through an [`Error::Closed`] notification.
    pub fn destroy_with_code(&mut self, code: impl Into<CloseCode>) {
        self.socket.destroy_session(self.handle, None, Some(code.into()));
    }

    /// Initiate a key update
    pub fn update_key(&mut self) -> Result<(), Error> {
        let session = live_mut(&mut self.socket.sessions, self.handle, "update_key")?;
        if session.closing {
            return Err(Error::closing("Session", "update_key"));
        }
        if !session.handshake_confirmed {
            return Err(Error::InvalidState("handshake is not confirmed"));
        }
        let connection = session
            .connection
            .ok_or(Error::InvalidState("session has no connection"))?;
        self.socket.engine.update_key(connection)?;
        session.stats.key_update_count += 1;
        Ok(())
    }

    /// Elicit an acknowledgement from the peer
    pub fn ping(&mut self) -> Result<(), Error> {
        let session = live(&self.socket.sessions, self.handle, "ping")?;
        let connection = session
            .connection
            .ok_or(Error::InvalidState("session has no connection"))?;
        self.socket.engine.ping(connection);
        Ok(())
    }

    /// DER-encoded local certificate
    pub fn certificate(&self) -> Result<Option<Bytes>, Error> {
        let session = live(&self.socket.sessions, self.handle, "certificate")?;
        Ok(session
            .connection
            .and_then(|c| self.socket.engine.certificate(c)))
    }

    /// DER-encoded peer certificate chain, leaf first
    pub fn peer_certificate(&self) -> Result<Vec<Bytes>, Error> {
        let session = live(&self.socket.sessions, self.handle, "peer_certificate")?;
        Ok(session
            .connection
            .map(|c| self.socket.engine.peer_certificate(c))
            .unwrap_or_default())
    }

    /// Server name requested by the client
    pub fn servername(&self) -> Option<&str> {
        self.inner()?.servername.as_deref()
    }

    /// Negotiated application protocol
    pub fn alpn_protocol(&self) -> Option<&str> {
        Some(self.handshake()?.alpn.as_str())
    }

    /// Negotiated cipher
    pub fn cipher(&self) -> Option<&CipherInfo> {
        Some(&self.handshake()?.cipher)
    }

    /// Whether the handshake completed and the peer certificate verified
    pub fn authenticated(&self) -> bool {
        self.handshake().is_some_and(|h| h.verify_error.is_none())
    }

    /// Why the peer certificate failed verification
    pub fn authentication_error(&self) -> Option<&VerifyError> {
        self.handshake()?.verify_error.as_ref()
    }

    /// Whether 0-RTT data was accepted
    pub fn early_data(&self) -> bool {
        self.handshake().is_some_and(|h| h.early_data)
    }

    /// Whether the TLS handshake completed
    pub fn handshake_complete(&self) -> bool {
        self.handshake().is_some()
    }

    /// Whether the peer confirmed the handshake
    pub fn handshake_confirmed(&self) -> bool {
        self.inner().is_some_and(|s| s.handshake_confirmed)
    }

    /// Largest packet size the path supports
    pub fn max_packet_length(&self) -> Option<u64> {
        Some(self.handshake()?.max_packet_length)
    }

    /// Idle timeout in effect after negotiation
    pub fn idle_timeout(&self) -> Option<Duration> {
        Some(self.handshake()?.idle_timeout)
    }

    /// The code the session will close, or closed, with
    pub fn close_code(&self) -> Option<CloseCode> {
        Some(self.inner()?.close)
    }

    /// Whether the session closed without sending CONNECTION_CLOSE
    pub fn silent_close(&self) -> bool {
        self.inner().is_some_and(|s| s.silent_close)
    }

    /// Whether the session closed because the peer sent a stateless reset
    pub fn stateless_reset(&self) -> bool {
        self.inner().is_some_and(|s| s.stateless_reset)
    }

    /// The peer's address
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner()?.remote
    }

    /// Statistics, including a fresh snapshot of the engine's counters
    pub fn stats(&self) -> Option<SessionStats> {
        let session = self.inner()?;
        let mut stats = session.stats;
        if let Some(connection) = session.connection {
            stats.engine = self.socket.engine.session_stats(connection);
        }
        Some(stats)
    }

    /// Streams that have not been destroyed, in creation order
    pub fn streams(&self) -> Vec<StreamHandle> {
        self.inner()
            .map(|s| {
                s.streams
                    .keys()
                    .map(|&key| StreamHandle {
                        session: self.handle,
                        key,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn inner(&self) -> Option<&SessionInner> {
        self.socket.sessions.get(&self.handle)
    }

    fn handshake(&self) -> Option<&HandshakeInfo> {
        self.inner()?.handshake.as_ref()
    }
}
