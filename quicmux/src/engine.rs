//! The contract between the orchestration core and the QUIC protocol engine
//!
//! The engine owns everything below the session abstraction: packet encoding, loss recovery,
//! congestion control and the TLS record layer. The core drives it through [`TransportEngine`]
//! and learns about protocol progress from the [`EngineEvent`]s fed into
//! [`Socket::handle_event`](crate::Socket::handle_event).

use std::{fs::File, io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use thiserror::Error;

use crate::{
    config::{PreferredAddressPolicy, TransportParams},
    stats::{EngineSessionStats, EngineSocketStats},
    stream::headers::{Header, HeadersKind},
    tls::SecureContext,
    CloseCode, CloseFamily, ConnectionHandle, Dir, EndpointHandle, StreamId,
};

/// Operations the core needs from a QUIC protocol engine
///
/// Calls never re-enter the socket. Anything that completes later is reported back as an
/// [`EngineEvent`].
pub trait TransportEngine {
    /// Apply socket-wide options; called once when the socket is created
    fn configure(&mut self, options: &SocketOptions);

    /// Start sending and receiving on a freshly bound UDP socket
    fn add_endpoint(
        &mut self,
        endpoint: EndpointHandle,
        socket: std::net::UdpSocket,
        preferred: bool,
    ) -> Result<(), EngineError>;

    /// Stop using an endpoint; completes with [`EngineEvent::EndpointClosed`]
    fn close_endpoint(&mut self, endpoint: EndpointHandle);

    /// Whether the endpoint keeps the surrounding event loop alive
    fn set_endpoint_ref(&mut self, endpoint: EndpointHandle, referenced: bool);

    /// Begin accepting inbound connections
    fn listen(&mut self, params: ListenParams) -> Result<(), EngineError>;

    /// Stop accepting inbound connections
    fn stop_listening(&mut self);

    /// Reject new connection attempts with a "server busy" signal while `on`
    fn set_server_busy(&mut self, on: bool);

    /// Never answer unknown packets with stateless resets while `on`
    fn set_stateless_reset_disabled(&mut self, on: bool);

    /// Randomly drop received and transmitted packets, for testing
    fn set_diagnostic_packet_loss(&mut self, rx: f64, tx: f64);

    /// Create an outbound connection
    fn create_client_session(
        &mut self,
        params: ClientSessionParams,
    ) -> Result<ConnectionHandle, EngineError>;

    /// Send the first handshake flight of a client created with `auto_start` disabled
    fn start_handshake(&mut self, connection: ConnectionHandle);

    /// Resume a handshake paused on [`EngineEvent::ClientHello`]
    fn client_hello_done(&mut self, connection: ConnectionHandle, context: Option<SecureContext>);

    /// Resume a handshake paused on [`EngineEvent::CertificateRequest`]
    fn certificate_done(
        &mut self,
        connection: ConnectionHandle,
        context: Option<SecureContext>,
        ocsp_response: Option<Bytes>,
    );

    /// Stop accepting streams and close the connection once the existing ones finish
    fn graceful_close(&mut self, connection: ConnectionHandle);

    /// Send CONNECTION_CLOSE (unless `silent`) and free the connection immediately
    fn destroy_session(&mut self, connection: ConnectionHandle, close: CloseCode, silent: bool);

    /// Elicit an acknowledgement from the peer
    fn ping(&mut self, connection: ConnectionHandle);

    /// Initiate a key update
    fn update_key(&mut self, connection: ConnectionHandle) -> Result<(), EngineError>;

    /// DER-encoded local certificate
    fn certificate(&self, connection: ConnectionHandle) -> Option<Bytes>;

    /// DER-encoded peer certificate chain, leaf first
    fn peer_certificate(&self, connection: ConnectionHandle) -> Vec<Bytes>;

    /// Allocate a locally initiated stream, or `None` if the peer's limit is reached
    fn open_stream(&mut self, connection: ConnectionHandle, dir: Dir) -> Option<StreamId>;

    /// Queue data for transmission on a stream
    fn write_stream(
        &mut self,
        connection: ConnectionHandle,
        stream: StreamId,
        data: Bytes,
    ) -> Result<(), EngineError>;

    /// Send FIN after all queued data
    fn shutdown_stream(
        &mut self,
        connection: ConnectionHandle,
        stream: StreamId,
    ) -> Result<(), EngineError>;

    /// Resume delivering received data for a stream
    fn read_start(&mut self, connection: ConnectionHandle, stream: StreamId);

    /// Hold received data for a stream in the engine's buffers
    fn read_stop(&mut self, connection: ConnectionHandle, stream: StreamId);

    /// Send RESET_STREAM and/or STOP_SENDING
    fn reset_stream(
        &mut self,
        connection: ConnectionHandle,
        stream: StreamId,
        code: CloseCode,
        directions: ResetDirections,
    );

    /// Send a header block
    fn submit_headers(
        &mut self,
        connection: ConnectionHandle,
        stream: StreamId,
        kind: HeadersKind,
        headers: &[Header],
        terminal: bool,
    ) -> Result<(), EngineError>;

    /// Pipe a file straight into the stream's send buffer
    ///
    /// Completes with [`EngineEvent::StreamFileDone`].
    fn send_file(
        &mut self,
        connection: ConnectionHandle,
        stream: StreamId,
        file: Arc<File>,
        offset: Option<u64>,
        length: Option<u64>,
    ) -> Result<(), EngineError>;

    /// Release the engine's state for a stream
    fn destroy_stream(&mut self, connection: ConnectionHandle, stream: StreamId);

    /// Counters for a connection
    fn session_stats(&self, connection: ConnectionHandle) -> EngineSessionStats {
        let _ = connection;
        EngineSessionStats::default()
    }

    /// Counters for the whole socket
    fn socket_stats(&self) -> EngineSocketStats {
        EngineSocketStats::default()
    }
}

/// Protocol progress reported by the engine
#[derive(Debug)]
#[non_exhaustive]
pub enum EngineEvent {
    /// The engine's socket failed; the socket is destroyed with this error
    SocketError {
        /// What went wrong
        error: EngineError,
    },
    /// An endpoint finished closing
    EndpointClosed {
        /// The endpoint
        endpoint: EndpointHandle,
        /// Error the underlying UDP socket closed with, if any
        error: Option<io::Error>,
    },
    /// The engine toggled admission control on its own
    ServerBusy {
        /// Whether new connections are being refused
        on: bool,
    },
    /// An inbound connection reached the point where a session can be created
    NewSession {
        /// The connection
        connection: ConnectionHandle,
        /// The client's address
        remote: SocketAddr,
    },
    /// The TLS ClientHello arrived and the server asked to inspect it
    ClientHello {
        /// The connection
        connection: ConnectionHandle,
        /// Offered application protocol
        alpn: String,
        /// Requested server name
        servername: String,
        /// Offered cipher suite names
        ciphers: Vec<String>,
    },
    /// The TLS stack needs the server certificate
    CertificateRequest {
        /// The connection
        connection: ConnectionHandle,
        /// Requested server name
        servername: String,
    },
    /// The server stapled an OCSP response
    OcspResponse {
        /// The connection
        connection: ConnectionHandle,
        /// The DER-encoded response
        response: Bytes,
    },
    /// The TLS handshake completed
    HandshakeComplete {
        /// The connection
        connection: ConnectionHandle,
        /// Negotiated parameters
        info: HandshakeInfo,
    },
    /// The peer confirmed the handshake
    HandshakeConfirmed {
        /// The connection
        connection: ConnectionHandle,
    },
    /// A ticket for resuming this session later is available
    SessionTicket {
        /// The connection
        connection: ConnectionHandle,
        /// The ticket
        ticket: Bytes,
        /// The server's transport parameters, needed with the ticket for 0-RTT
        transport_params: Bytes,
    },
    /// Path validation finished
    PathValidation {
        /// The connection
        connection: ConnectionHandle,
        /// Outcome
        result: PathValidationResult,
        /// Local address of the validated path
        local: SocketAddr,
        /// Remote address of the validated path
        remote: SocketAddr,
    },
    /// The client is migrating to the server's preferred address
    UsePreferredAddress {
        /// The connection
        connection: ConnectionHandle,
        /// The address in use from now on
        address: SocketAddr,
    },
    /// A qlog record
    Qlog {
        /// The connection
        connection: ConnectionHandle,
        /// The record
        record: Bytes,
    },
    /// A TLS key log line
    Keylog {
        /// The connection
        connection: ConnectionHandle,
        /// The line, without a trailing newline
        line: Bytes,
    },
    /// The connection is gone: idle timeout, peer close or stateless reset
    SessionClosed {
        /// The connection
        connection: ConnectionHandle,
        /// Close code to report
        close: CloseCode,
        /// Whether the connection closed without sending CONNECTION_CLOSE
        silent: bool,
        /// Whether the peer sent a stateless reset
        stateless_reset: bool,
    },
    /// Version negotiation failed
    VersionNegotiation {
        /// The connection
        connection: ConnectionHandle,
        /// Version used in the attempt
        version: u32,
        /// Versions we requested
        requested: Vec<u32>,
        /// Versions the peer supports
        supported: Vec<u32>,
    },
    /// The peer opened a stream
    NewStream {
        /// The connection
        connection: ConnectionHandle,
        /// The new stream
        stream: StreamId,
    },
    /// Data (and possibly FIN) arrived on a stream
    StreamData {
        /// The connection
        connection: ConnectionHandle,
        /// The stream
        stream: StreamId,
        /// Payload in order
        data: Bytes,
        /// Whether this is the end of the stream
        fin: bool,
    },
    /// The peer acknowledged written data
    StreamAcked {
        /// The connection
        connection: ConnectionHandle,
        /// The stream
        stream: StreamId,
        /// Number of newly acknowledged bytes
        bytes: u64,
    },
    /// A stream is blocked by flow control
    StreamBlocked {
        /// The connection
        connection: ConnectionHandle,
        /// The stream
        stream: StreamId,
    },
    /// The peer reset its sending half of a stream
    StreamReset {
        /// The connection
        connection: ConnectionHandle,
        /// The stream
        stream: StreamId,
        /// Application error code
        code: u64,
        /// Final size of the stream
        final_size: u64,
    },
    /// Both halves of a stream are finished and the engine released it
    StreamClosed {
        /// The connection
        connection: ConnectionHandle,
        /// The stream
        stream: StreamId,
        /// Application error code, zero when closed cleanly
        code: u64,
    },
    /// The engine failed a stream
    StreamError {
        /// The connection
        connection: ConnectionHandle,
        /// The stream
        stream: StreamId,
        /// The failure
        error: EngineError,
    },
    /// A header block arrived
    StreamHeaders {
        /// The connection
        connection: ConnectionHandle,
        /// The stream
        stream: StreamId,
        /// Which block
        kind: HeadersKind,
        /// The headers
        headers: Vec<Header>,
    },
    /// A [`TransportEngine::send_file`] transfer finished
    StreamFileDone {
        /// The connection
        connection: ConnectionHandle,
        /// The stream
        stream: StreamId,
        /// Outcome
        result: io::Result<()>,
    },
}

/// Engine failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not create the session
    #[error("failed to create QUIC session")]
    FailedToCreateSession,
    /// The remembered remote transport parameters were rejected
    #[error("invalid remote transport parameters")]
    InvalidRemoteTransportParams,
    /// The remembered session ticket was rejected
    #[error("invalid TLS session ticket")]
    InvalidSessionTicket,
    /// The engine refused the operation in its current state
    #[error("operation refused by the transport engine")]
    Refused,
    /// A protocol failure identified only by its code
    #[error("QUIC {family} error {code}")]
    Protocol {
        /// The code
        code: u64,
        /// The space `code` belongs to
        family: CloseFamily,
    },
}

/// Socket-wide options applied through [`TransportEngine::configure`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Require address validation before accepting a connection
    pub validate_address: bool,
    /// Maximum concurrent inbound connections
    pub max_connections: u32,
    /// Maximum concurrent inbound connections per host
    pub max_connections_per_host: u32,
    /// Maximum stateless resets sent to one host
    pub max_stateless_resets_per_host: u32,
    /// Lifetime of Retry tokens
    pub retry_token_timeout: Duration,
    /// Never send stateless resets
    pub disable_stateless_reset: bool,
    /// Secret for deriving stateless reset tokens
    pub stateless_reset_secret: Option<[u8; 16]>,
    /// Emit qlog records
    pub qlog: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            validate_address: false,
            max_connections: 100,
            max_connections_per_host: 100,
            max_stateless_resets_per_host: 10,
            retry_token_timeout: Duration::from_secs(10),
            disable_stateless_reset: false,
            stateless_reset_secret: None,
            qlog: false,
        }
    }
}

/// Everything the engine needs to start accepting connections
#[derive(Debug, Clone)]
pub struct ListenParams {
    /// Server context presented to clients
    pub context: SecureContext,
    /// Application protocol
    pub alpn: String,
    /// Resolved preferred address, if one is advertised
    pub preferred_address: Option<SocketAddr>,
    /// Transport parameters
    pub transport: TransportParams,
    /// Pause handshakes on the ClientHello
    pub client_hello: bool,
    /// Pause handshakes to obtain an OCSP response
    pub ocsp: bool,
    /// Ask clients for a certificate
    pub request_cert: bool,
    /// Fail handshakes with unverified client certificates
    pub reject_unauthorized: bool,
}

/// Everything the engine needs to create an outbound connection
#[derive(Debug, Clone)]
pub struct ClientSessionParams {
    /// Resolved server address
    pub remote: SocketAddr,
    /// Client context
    pub context: SecureContext,
    /// Name sent in SNI
    pub servername: String,
    /// Application protocol
    pub alpn: String,
    /// Transport parameters
    pub transport: TransportParams,
    /// Remembered server transport parameters, for 0-RTT
    pub remote_transport_params: Option<Bytes>,
    /// Remembered session ticket, for resumption
    pub session_ticket: Option<Bytes>,
    /// Whether to follow the server's preferred address
    pub preferred_address_policy: PreferredAddressPolicy,
    /// Check the server certificate against `servername`
    pub verify_hostname_identity: bool,
    /// Ask the server to staple an OCSP response
    pub request_ocsp: bool,
    /// Send the first flight immediately
    pub auto_start: bool,
    /// Emit qlog records
    pub qlog: bool,
}

/// Parameters negotiated by the TLS handshake
#[derive(Debug, Clone, Default)]
pub struct HandshakeInfo {
    /// Server name the client asked for
    pub servername: String,
    /// Negotiated application protocol
    pub alpn: String,
    /// Negotiated cipher
    pub cipher: CipherInfo,
    /// Largest packet size the path supports
    pub max_packet_length: u64,
    /// Why the peer certificate failed verification, if it did
    pub verify_error: Option<VerifyError>,
    /// Whether 0-RTT data was accepted
    pub early_data: bool,
    /// Ephemeral key exchange parameters, when the engine exposes them
    pub ephemeral_key: Option<EphemeralKeyInfo>,
    /// Idle timeout in effect after negotiation
    pub idle_timeout: Duration,
}

/// A negotiated cipher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipherInfo {
    /// Cipher suite name
    pub name: String,
    /// Protocol version name
    pub version: String,
}

/// A failed certificate verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    /// Human-readable reason
    pub reason: String,
    /// Short machine-readable code
    pub code: String,
}

/// The kind of ephemeral key exchange used
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyExchange {
    /// Finite-field Diffie-Hellman
    Dh,
    /// Elliptic-curve Diffie-Hellman
    Ecdh,
}

/// Ephemeral key exchange parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralKeyInfo {
    /// Exchange kind
    pub kind: KeyExchange,
    /// Group name
    pub name: String,
    /// Size in bits
    pub size: u32,
}

/// Outcome of validating a new network path
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PathValidationResult {
    /// The peer proved it can receive on the path
    Success,
    /// Validation timed out
    Failure,
}

/// Which frames to send when aborting a stream
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResetDirections {
    /// Send RESET_STREAM for our sending half
    pub reset: bool,
    /// Send STOP_SENDING for our receiving half
    pub stop_sending: bool,
}
