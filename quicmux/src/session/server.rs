use std::{net::SocketAddr, time::Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use super::{live_mut, Session, SessionInner, SessionKind, SessionPhase};
use crate::{
    error::Error,
    event::{SessionEvent, SocketEvent},
    socket::Socket,
    tls::{SecureContext, SniContexts},
    CloseCode, ConnectionHandle, SessionHandle, Side,
};

/// QUIC transport error sent to connections that arrive while we are not accepting
const CONNECTION_REFUSED: u64 = 0x2;

#[derive(Debug)]
pub(crate) struct ServerState {
    sni: SniContexts,
    client_hello: bool,
    ocsp: bool,
    awaiting_client_hello: bool,
    /// Context chosen for the pending certificate request, held until the OCSP response
    awaiting_ocsp: Option<Option<SecureContext>>,
}

impl Socket {
    /// Create a server session for a connection the engine accepted
    pub(crate) fn accept_session(&mut self, connection: ConnectionHandle, remote: SocketAddr) {
        let listener = match self.listener {
            Some(ref listener) if self.accepting_sessions() => listener,
            _ => {
                debug!(?connection, %remote, "refusing inbound session");
                self.engine.destroy_session(
                    connection,
                    CloseCode::transport(CONNECTION_REFUSED),
                    false,
                );
                return;
            }
        };
        let state = ServerState {
            sni: listener.config.sni.clone(),
            client_hello: listener.config.client_hello,
            ocsp: listener.config.ocsp,
            awaiting_client_hello: false,
            awaiting_ocsp: None,
        };
        let hwm = listener.config.stream_high_water_mark;
        let now = Instant::now();
        let mut session = SessionInner::new(Side::Server, SessionKind::Server(state), hwm, now);
        session.connection = Some(connection);
        session.remote = Some(remote);
        session.phase = SessionPhase::Handshaking;
        session.stats.handshake_start_at = Some(now);

        let handle = SessionHandle(self.alloc_id());
        self.sessions.insert(handle, session);
        self.connections.insert(connection, handle);
        self.stats.server_sessions += 1;
        debug!(session = ?handle, ?connection, %remote, "accepted session");
        self.tasks.socket(SocketEvent::Session(handle));
    }

    pub(crate) fn session_client_hello(
        &mut self,
        handle: SessionHandle,
        alpn: String,
        servername: String,
        ciphers: Vec<String>,
    ) {
        let Some(session) = self.sessions.get_mut(&handle) else {
            return;
        };
        let SessionKind::Server(ref mut server) = session.kind else {
            return;
        };
        session.servername = Some(servername.clone());
        if !server.client_hello {
            if let Some(connection) = session.connection {
                self.engine.client_hello_done(connection, None);
            }
            return;
        }
        server.awaiting_client_hello = true;
        self.tasks.session(
            handle,
            SessionEvent::ClientHello {
                alpn,
                servername,
                ciphers,
            },
        );
    }

    pub(crate) fn session_certificate_request(
        &mut self,
        handle: SessionHandle,
        servername: String,
    ) {
        let Some(session) = self.sessions.get_mut(&handle) else {
            return;
        };
        let SessionKind::Server(ref mut server) = session.kind else {
            return;
        };
        let context = server.sni.select(&servername).cloned();
        trace!(session = ?handle, %servername, sni = context.is_some(), "certificate requested");
        if server.ocsp {
            server.awaiting_ocsp = Some(context);
            self.tasks
                .session(handle, SessionEvent::OcspRequest { servername });
            return;
        }
        if let Some(connection) = session.connection {
            self.engine.certificate_done(connection, context, None);
        }
    }
}

impl Session<'_> {
    /// Resume a handshake paused on [`SessionEvent::ClientHello`]
    ///
    /// `context` replaces the listening context for this session.
    pub fn client_hello_done(&mut self, context: Option<SecureContext>) -> Result<(), Error> {
        let session = live_mut(&mut self.socket.sessions, self.handle, "client_hello_done")?;
        let SessionKind::Server(ref mut server) = session.kind else {
            return Err(Error::InvalidState("only server sessions receive a client hello"));
        };
        if !server.awaiting_client_hello {
            return Err(Error::InvalidState("no client hello is pending"));
        }
        if context.as_ref().is_some_and(|c| c.side() != Side::Server) {
            return Err(Error::InvalidState("a server context is required"));
        }
        server.awaiting_client_hello = false;
        if let Some(connection) = session.connection {
            self.socket.engine.client_hello_done(connection, context);
        }
        Ok(())
    }

    /// Answer a [`SessionEvent::OcspRequest`], optionally stapling a response
    pub fn ocsp_response(&mut self, response: Option<Bytes>) -> Result<(), Error> {
        let session = live_mut(&mut self.socket.sessions, self.handle, "ocsp_response")?;
        let SessionKind::Server(ref mut server) = session.kind else {
            return Err(Error::InvalidState("only server sessions answer OCSP requests"));
        };
        let Some(context) = server.awaiting_ocsp.take() else {
            return Err(Error::InvalidState("no OCSP request is pending"));
        };
        if let Some(connection) = session.connection {
            self.socket
                .engine
                .certificate_done(connection, context, response);
        }
        Ok(())
    }
}
