use std::{collections::VecDeque, fmt, net::SocketAddr};

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::{
    engine::{CipherInfo, PathValidationResult},
    error::Error,
    stats::{SessionStats, SocketStats, StreamStats},
    stream::{
        headers::{Header, HeadersKind},
        ResetInfo,
    },
    CloseCode, EndpointHandle, SessionHandle, StreamHandle,
};

/// A notification produced by [`Socket::poll`](crate::Socket::poll)
#[derive(Debug)]
pub enum Event {
    /// Concerns the socket itself
    Socket(SocketEvent),
    /// Concerns one session
    Session {
        /// The session
        session: SessionHandle,
        /// What happened
        event: SessionEvent,
    },
    /// Concerns one stream
    Stream {
        /// The stream
        stream: StreamHandle,
        /// What happened
        event: StreamEvent,
    },
}

/// Socket notifications
#[derive(Debug)]
pub enum SocketEvent {
    /// The first endpoint is bound
    Ready,
    /// The engine is accepting inbound sessions
    Listening,
    /// A session was accepted
    Session(SessionHandle),
    /// Admission control changed
    Busy(bool),
    /// An endpoint finished closing
    EndpointClose {
        /// The endpoint
        endpoint: EndpointHandle,
        /// What it was destroyed with, if anything
        error: Option<Error>,
    },
    /// The socket is being destroyed because of this error; always followed by `Close`
    Error(Error),
    /// The socket is gone
    Close {
        /// Final statistics
        stats: SocketStats,
    },
}

/// Session notifications
#[derive(Debug)]
pub enum SessionEvent {
    /// A client session has been handed to the engine
    Ready,
    /// The server may pick a context for this ClientHello with
    /// [`Session::client_hello_done`](crate::Session::client_hello_done)
    ClientHello {
        /// Offered application protocol
        alpn: String,
        /// Requested server name
        servername: String,
        /// Offered cipher suite names
        ciphers: Vec<String>,
    },
    /// The server may staple an OCSP response with
    /// [`Session::ocsp_response`](crate::Session::ocsp_response)
    OcspRequest {
        /// Requested server name
        servername: String,
    },
    /// The server stapled an OCSP response
    OcspResponse(Bytes),
    /// The handshake completed
    Secure {
        /// Server name the client asked for
        servername: String,
        /// Negotiated application protocol
        alpn: String,
        /// Negotiated cipher
        cipher: CipherInfo,
    },
    /// A resumption ticket is available
    SessionTicket {
        /// The ticket
        ticket: Bytes,
        /// The server's transport parameters
        transport_params: Bytes,
    },
    /// Path validation finished
    PathValidation {
        /// Outcome
        result: PathValidationResult,
        /// Local address of the path
        local: SocketAddr,
        /// Remote address of the path
        remote: SocketAddr,
    },
    /// The client switched to the server's preferred address
    UsePreferredAddress(SocketAddr),
    /// A qlog record
    Qlog(Bytes),
    /// A TLS key log line
    Keylog(Bytes),
    /// The peer opened a stream
    Stream(StreamHandle),
    /// The session is being destroyed because of this error; always followed by `Close`
    Error(Error),
    /// The session is gone
    Close {
        /// The code the session closed with
        code: CloseCode,
        /// Whether the session closed without sending CONNECTION_CLOSE
        silent: bool,
        /// Whether the peer sent a stateless reset
        stateless_reset: bool,
        /// Final statistics
        stats: SessionStats,
    },
}

/// Stream notifications
#[derive(Debug)]
pub enum StreamEvent {
    /// The engine allocated the stream; queued writes have been flushed
    Ready,
    /// Data is available to [`Stream::read`](crate::Stream::read)
    Readable,
    /// All data has been read; nothing more will arrive
    End,
    /// The FIN has been handed to the engine
    Finish,
    /// Buffered writes fell back below the high-water mark
    Drain,
    /// Flow control is holding back writes
    Blocked,
    /// A header block arrived
    Headers {
        /// Which block
        kind: HeadersKind,
        /// The headers
        headers: Vec<Header>,
    },
    /// The peer reset its sending half
    Reset(ResetInfo),
    /// The stream was abruptly closed while still active
    Abort {
        /// The code sent in RESET_STREAM/STOP_SENDING
        code: CloseCode,
    },
    /// The stream is being destroyed because of this error; always followed by `Close`
    Error(Error),
    /// The stream is gone
    Close {
        /// Final statistics
        stats: StreamStats,
    },
}

/// Deferred work, drained in order by [`Socket::poll`](crate::Socket::poll)
#[derive(Debug)]
pub(crate) enum Task {
    Emit(Event),
    /// Completes the close of an endpoint the engine never knew about
    EndpointClosed {
        endpoint: EndpointHandle,
        error: Option<Error>,
    },
}

/// FIFO queue of deferred work owned by the socket
#[derive(Debug, Default)]
pub(crate) struct Tasks(VecDeque<Task>);

impl Tasks {
    pub(crate) fn push(&mut self, task: Task) {
        self.0.push_back(task);
    }

    pub(crate) fn pop(&mut self) -> Option<Task> {
        self.0.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn socket(&mut self, event: SocketEvent) {
        self.push(Task::Emit(Event::Socket(event)));
    }

    pub(crate) fn session(&mut self, session: SessionHandle, event: SessionEvent) {
        self.push(Task::Emit(Event::Session { session, event }));
    }

    pub(crate) fn stream(&mut self, stream: StreamHandle, event: StreamEvent) {
        self.push(Task::Emit(Event::Stream { stream, event }));
    }
}

pub(crate) type SessionCallback = Box<dyn FnMut(SessionHandle)>;
pub(crate) type ReadyCallback = Box<dyn FnOnce(SessionHandle)>;
pub(crate) type CloseCallback = Box<dyn FnOnce(Option<&Error>)>;

/// Callbacks registered through `listen`, `connect` and `close`
///
/// They run while the matching event is drained from the task queue, after the core has
/// finished updating its state, and only ever see the event payload.
#[derive(Default)]
pub(crate) struct Callbacks {
    on_session: Option<SessionCallback>,
    on_ready: FxHashMap<SessionHandle, ReadyCallback>,
    on_socket_close: Vec<CloseCallback>,
    on_session_close: FxHashMap<SessionHandle, Vec<CloseCallback>>,
    socket_error: Option<Error>,
    session_errors: FxHashMap<SessionHandle, Error>,
}

impl Callbacks {
    pub(crate) fn on_session(&mut self, cb: SessionCallback) {
        self.on_session = Some(cb);
    }

    pub(crate) fn on_ready(&mut self, session: SessionHandle, cb: ReadyCallback) {
        self.on_ready.insert(session, cb);
    }

    pub(crate) fn on_socket_close(&mut self, cb: CloseCallback) {
        self.on_socket_close.push(cb);
    }

    pub(crate) fn on_session_close(&mut self, session: SessionHandle, cb: CloseCallback) {
        self.on_session_close.entry(session).or_default().push(cb);
    }

    pub(crate) fn dispatch(&mut self, event: &Event) {
        match *event {
            Event::Socket(SocketEvent::Session(session)) => {
                if let Some(cb) = self.on_session.as_mut() {
                    cb(session);
                }
            }
            Event::Socket(SocketEvent::Error(ref e)) => self.socket_error = Some(e.clone()),
            Event::Socket(SocketEvent::Close { .. }) => {
                self.on_session = None;
                for cb in self.on_socket_close.drain(..) {
                    cb(self.socket_error.as_ref());
                }
            }
            Event::Session {
                session,
                event: SessionEvent::Ready,
            } => {
                if let Some(cb) = self.on_ready.remove(&session) {
                    cb(session);
                }
            }
            Event::Session {
                session,
                event: SessionEvent::Error(ref e),
            } => {
                self.session_errors.insert(session, e.clone());
            }
            Event::Session {
                session,
                event: SessionEvent::Close { .. },
            } => {
                self.on_ready.remove(&session);
                let error = self.session_errors.remove(&session);
                for cb in self.on_session_close.remove(&session).unwrap_or_default() {
                    cb(error.as_ref());
                }
            }
            _ => {}
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_session", &self.on_session.is_some())
            .field("on_ready", &self.on_ready.len())
            .field("on_socket_close", &self.on_socket_close.len())
            .field("on_session_close", &self.on_session_close.len())
            .finish()
    }
}
