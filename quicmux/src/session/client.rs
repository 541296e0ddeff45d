use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use tracing::{debug, trace};

use super::{live, live_mut, Session, SessionInner, SessionKind, SessionPhase};
use crate::{
    config::ClientConfig,
    engine::{ClientSessionParams, EphemeralKeyInfo},
    error::Error,
    event::SessionEvent,
    lookup::LookupToken,
    socket::{LookupPurpose, Socket},
    tls::SecureContext,
    SessionHandle, Side,
};

#[derive(Debug)]
pub(crate) struct ClientState {
    pub(crate) config: ClientConfig,
    context: SecureContext,
    pub(crate) lookup: Option<LookupToken>,
    handshake_started: bool,
}

impl SessionInner {
    pub(crate) fn client(config: ClientConfig, context: SecureContext, now: Instant) -> Self {
        let servername = config
            .servername
            .clone()
            .unwrap_or_else(|| config.address.clone());
        let hwm = config.stream_high_water_mark;
        let state = ClientState {
            config,
            context,
            lookup: None,
            handshake_started: false,
        };
        let mut session = Self::new(Side::Client, SessionKind::Client(state), hwm, now);
        session.servername = Some(servername);
        session
    }
}

impl Socket {
    /// Resolve the server address of a client session whose socket is bound
    pub(crate) fn resolve_remote(&mut self, handle: SessionHandle) {
        let Some(session) = self.sessions.get(&handle) else {
            return;
        };
        let SessionKind::Client(ref client) = session.kind else {
            return;
        };
        if session.destroyed || session.connection.is_some() || client.lookup.is_some() {
            return;
        }
        let host = client.config.address.clone();
        let family = client.config.family;
        let token = self.alloc_lookup(LookupPurpose::Connect(handle));
        if let Some(SessionKind::Client(client)) =
            self.sessions.get_mut(&handle).map(|s| &mut s.kind)
        {
            client.lookup = Some(token);
        }
        trace!(session = ?handle, %host, "resolving server address");
        self.lookup.lookup(token, &host, family);
    }

    /// Hand a client session to the engine once its server address is known
    pub(crate) fn remote_resolved(
        &mut self,
        handle: SessionHandle,
        token: LookupToken,
        result: io::Result<IpAddr>,
    ) {
        let Some(session) = self.sessions.get_mut(&handle) else {
            return;
        };
        let SessionKind::Client(ref mut client) = session.kind else {
            return;
        };
        if session.destroyed || client.lookup != Some(token) {
            return;
        }
        client.lookup = None;

        let ip = match result {
            Ok(ip) => ip,
            Err(e) => {
                let error = Error::Lookup {
                    host: client.config.address.clone(),
                    source: Arc::new(e),
                };
                self.destroy_session(handle, Some(error), None);
                return;
            }
        };
        let remote = SocketAddr::new(ip, client.config.port);
        let config = &client.config;
        let auto_start = config.auto_start;
        let params = ClientSessionParams {
            remote,
            context: client.context.clone(),
            servername: session.servername.clone().unwrap_or_default(),
            alpn: config.alpn.clone().unwrap_or_default(),
            transport: config.transport.clone(),
            remote_transport_params: config.remote_transport_params.clone(),
            session_ticket: config.session_ticket.clone(),
            preferred_address_policy: config.preferred_address_policy,
            verify_hostname_identity: config.verify_hostname_identity,
            request_ocsp: config.request_ocsp,
            auto_start,
            qlog: config.qlog,
        };
        session.remote = Some(remote);

        let connection = match self.engine.create_client_session(params) {
            Ok(connection) => connection,
            Err(e) => {
                debug!(session = ?handle, %remote, error = %e, "engine refused client session");
                self.destroy_session(handle, Some(e.into()), None);
                return;
            }
        };
        self.connections.insert(connection, handle);
        if let Some(session) = self.sessions.get_mut(&handle) {
            session.connection = Some(connection);
            session.phase = SessionPhase::Handshaking;
            if auto_start {
                session.stats.handshake_start_at = Some(Instant::now());
                if let SessionKind::Client(ref mut client) = session.kind {
                    client.handshake_started = true;
                }
            }
        }
        debug!(session = ?handle, ?connection, %remote, "client session ready");
        self.tasks.session(handle, SessionEvent::Ready);
    }

    pub(crate) fn session_ocsp_response(&mut self, handle: SessionHandle, response: bytes::Bytes) {
        self.tasks
            .session(handle, SessionEvent::OcspResponse(response));
    }
}

impl Session<'_> {
    /// Start the handshake of a client created with `auto_start` disabled
    ///
    /// Called before the session is ready, the handshake starts as soon as the engine creates the
    /// connection.
    pub fn start_handshake(&mut self) -> Result<(), Error> {
        let session = live_mut(&mut self.socket.sessions, self.handle, "start_handshake")?;
        let SessionKind::Client(ref mut client) = session.kind else {
            return Err(Error::InvalidState("only client sessions start a handshake"));
        };
        if client.handshake_started {
            return Ok(());
        }
        match session.connection {
            None => client.config.auto_start = true,
            Some(connection) => {
                client.handshake_started = true;
                session.stats.handshake_start_at = Some(Instant::now());
                self.socket.engine.start_handshake(connection);
            }
        }
        Ok(())
    }

    /// Whether 0-RTT may be attempted: both remote transport parameters and a session ticket were
    /// supplied
    pub fn allow_early_data(&self) -> bool {
        match self.inner().map(|s| &s.kind) {
            Some(SessionKind::Client(client)) => {
                client.config.remote_transport_params.is_some()
                    && client.config.session_ticket.is_some()
            }
            _ => false,
        }
    }

    /// Ephemeral key exchange parameters negotiated with the server
    pub fn ephemeral_key_info(&self) -> Result<Option<&EphemeralKeyInfo>, Error> {
        let session = live(&self.socket.sessions, self.handle, "ephemeral_key_info")?;
        if session.side.is_server() {
            return Err(Error::InvalidState("only client sessions expose key exchange info"));
        }
        Ok(session
            .handshake
            .as_ref()
            .and_then(|h| h.ephemeral_key.as_ref()))
    }
}
