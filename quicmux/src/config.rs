use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::{
    engine::SocketOptions,
    lookup::AddressFamily,
    tls::{SniContexts, TlsConfig},
    DEFAULT_HIGH_WATER_MARK, DEFAULT_MIN_DH_SIZE,
};

/// Global configuration for a [`Socket`](crate::Socket)
///
/// Holds the preferred endpoint, the options handed to the engine when the socket is created,
/// and the defaults used by [`Socket::listen`](crate::Socket::listen) and
/// [`Socket::connect`](crate::Socket::connect).
#[derive(Debug, Clone, Default)]
pub struct SocketConfig {
    pub(crate) endpoint: EndpointConfig,
    pub(crate) options: SocketOptions,
    pub(crate) client: ClientConfig,
    pub(crate) server: ServerConfig,
}

impl SocketConfig {
    /// The endpoint created together with the socket
    ///
    /// It is always marked preferred.
    pub fn endpoint(&mut self, value: EndpointConfig) -> &mut Self {
        self.endpoint = value;
        self.endpoint.preferred = true;
        self
    }

    /// Whether to require address validation (Retry) before accepting a connection
    pub fn validate_address(&mut self, value: bool) -> &mut Self {
        self.options.validate_address = value;
        self
    }

    /// Maximum number of concurrent inbound connections
    pub fn max_connections(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.options.max_connections = value;
        Ok(self)
    }

    /// Maximum number of concurrent inbound connections from a single host
    pub fn max_connections_per_host(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.options.max_connections_per_host = value;
        Ok(self)
    }

    /// Maximum number of stateless resets sent to a single host
    pub fn max_stateless_resets_per_host(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.options.max_stateless_resets_per_host = value;
        Ok(self)
    }

    /// How long a Retry token stays valid, between one and sixty seconds
    pub fn retry_token_timeout(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value < Duration::from_secs(1) || value > Duration::from_secs(60) {
            return Err(ConfigError::OutOfBounds);
        }
        self.options.retry_token_timeout = value;
        Ok(self)
    }

    /// Never send stateless resets
    pub fn disable_stateless_reset(&mut self, value: bool) -> &mut Self {
        self.options.disable_stateless_reset = value;
        self
    }

    /// Secret used to derive stateless reset tokens; random when unset
    pub fn stateless_reset_secret(&mut self, value: Option<[u8; 16]>) -> &mut Self {
        self.options.stateless_reset_secret = value;
        self
    }

    /// Whether sessions on this socket emit qlog records
    pub fn qlog(&mut self, value: bool) -> &mut Self {
        self.options.qlog = value;
        self
    }

    /// Defaults applied by [`Socket::connect`](crate::Socket::connect)
    pub fn client(&mut self, value: ClientConfig) -> &mut Self {
        self.client = value;
        self
    }

    /// Defaults applied by [`Socket::listen`](crate::Socket::listen)
    pub fn server(&mut self, value: ServerConfig) -> &mut Self {
        self.server = value;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint.validate()?;
        self.client.transport.validate()?;
        self.server.transport.validate()
    }
}

/// Parameters for one UDP binding
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub(crate) address: Option<String>,
    pub(crate) port: u16,
    pub(crate) family: AddressFamily,
    pub(crate) ipv6_only: bool,
    pub(crate) reuse_addr: bool,
    pub(crate) preferred: bool,
}

impl EndpointConfig {
    /// Host name or address to bind; the family's wildcard address when unset
    pub fn address(&mut self, value: impl Into<String>) -> &mut Self {
        self.address = Some(value.into());
        self
    }

    /// Port to bind; zero lets the OS pick one
    pub fn port(&mut self, value: u16) -> &mut Self {
        self.port = value;
        self
    }

    /// Address family to resolve and bind
    pub fn family(&mut self, value: AddressFamily) -> &mut Self {
        self.family = value;
        self
    }

    /// Refuse IPv4-mapped traffic on an IPv6 binding
    pub fn ipv6_only(&mut self, value: bool) -> &mut Self {
        self.ipv6_only = value;
        self
    }

    /// Allow rebinding an address that is still in use
    pub fn reuse_addr(&mut self, value: bool) -> &mut Self {
        self.reuse_addr = value;
        self
    }

    /// Whether the engine should send from this endpoint by default
    pub fn preferred(&mut self, value: bool) -> &mut Self {
        self.preferred = value;
        self
    }

    /// The name that will be looked up when binding
    pub(crate) fn host(&self) -> &str {
        match self.address {
            Some(ref address) => address,
            None => self.family.unspecified(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.ipv6_only && self.family == AddressFamily::V4 {
            return Err(ConfigError::IllegalValue("ipv6_only requires an IPv6 endpoint"));
        }
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: 0,
            family: AddressFamily::V4,
            ipv6_only: false,
            reuse_addr: false,
            preferred: false,
        }
    }
}

/// An address the server advertises for clients to migrate to after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferredAddress {
    /// Host name or address, resolved before listening starts
    pub host: String,
    /// Port advertised to clients
    pub port: u16,
    /// Family used to resolve `host`
    pub family: AddressFamily,
}

/// Whether a client follows a server's preferred address
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum PreferredAddressPolicy {
    /// Stay on the original path
    #[default]
    Ignore,
    /// Migrate to the advertised address
    Accept,
}

/// Options for accepting inbound sessions
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) alpn: Option<String>,
    pub(crate) tls: TlsConfig,
    pub(crate) transport: TransportParams,
    pub(crate) preferred_address: Option<PreferredAddress>,
    pub(crate) sni: SniContexts,
    pub(crate) client_hello: bool,
    pub(crate) ocsp: bool,
    pub(crate) request_cert: bool,
    pub(crate) reject_unauthorized: bool,
    pub(crate) stream_high_water_mark: usize,
}

impl ServerConfig {
    /// Application protocol offered during the handshake
    pub fn alpn(&mut self, value: impl Into<String>) -> Result<&mut Self, ConfigError> {
        self.alpn = Some(validate_alpn(value.into())?);
        Ok(self)
    }

    /// Certificates, key and cipher preferences for the server context
    pub fn tls(&mut self, value: TlsConfig) -> &mut Self {
        self.tls = value;
        self
    }

    /// Transport parameters advertised to clients
    pub fn transport(&mut self, value: TransportParams) -> Result<&mut Self, ConfigError> {
        value.validate()?;
        self.transport = value;
        Ok(self)
    }

    /// Address advertised for clients to migrate to
    pub fn preferred_address(&mut self, value: Option<PreferredAddress>) -> &mut Self {
        self.preferred_address = value;
        self
    }

    /// Per-servername context overrides, consulted in insertion order
    pub fn sni(&mut self, value: SniContexts) -> &mut Self {
        self.sni = value;
        self
    }

    /// Surface the TLS ClientHello and wait for
    /// [`Session::client_hello_done`](crate::Session::client_hello_done)
    pub fn client_hello(&mut self, value: bool) -> &mut Self {
        self.client_hello = value;
        self
    }

    /// Surface OCSP requests and wait for
    /// [`Session::ocsp_response`](crate::Session::ocsp_response)
    pub fn ocsp(&mut self, value: bool) -> &mut Self {
        self.ocsp = value;
        self
    }

    /// Ask clients for a certificate
    pub fn request_cert(&mut self, value: bool) -> &mut Self {
        self.request_cert = value;
        self
    }

    /// Fail handshakes whose client certificate does not verify
    pub fn reject_unauthorized(&mut self, value: bool) -> &mut Self {
        self.reject_unauthorized = value;
        self
    }

    /// Buffering threshold for streams of accepted sessions
    pub fn stream_high_water_mark(&mut self, value: usize) -> &mut Self {
        self.stream_high_water_mark = value;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.alpn.is_none() {
            return Err(ConfigError::IllegalValue("alpn is required"));
        }
        self.transport.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            alpn: None,
            tls: TlsConfig::default(),
            transport: TransportParams::default(),
            preferred_address: None,
            sni: SniContexts::default(),
            client_hello: false,
            ocsp: false,
            request_cert: false,
            reject_unauthorized: true,
            stream_high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Options for initiating a session
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) address: String,
    pub(crate) port: u16,
    pub(crate) family: AddressFamily,
    pub(crate) servername: Option<String>,
    pub(crate) alpn: Option<String>,
    pub(crate) tls: TlsConfig,
    pub(crate) transport: TransportParams,
    pub(crate) remote_transport_params: Option<Bytes>,
    pub(crate) session_ticket: Option<Bytes>,
    pub(crate) min_dh_size: u32,
    pub(crate) preferred_address_policy: PreferredAddressPolicy,
    pub(crate) verify_hostname_identity: bool,
    pub(crate) request_ocsp: bool,
    pub(crate) auto_start: bool,
    pub(crate) qlog: bool,
    pub(crate) stream_high_water_mark: usize,
}

impl ClientConfig {
    /// Host name or address of the server
    pub fn address(&mut self, value: impl Into<String>) -> &mut Self {
        self.address = value.into();
        self
    }

    /// Port of the server
    pub fn port(&mut self, value: u16) -> &mut Self {
        self.port = value;
        self
    }

    /// Family used when resolving the server address
    pub fn family(&mut self, value: AddressFamily) -> &mut Self {
        self.family = value;
        self
    }

    /// Name sent in the SNI extension; defaults to the address
    pub fn servername(&mut self, value: impl Into<String>) -> &mut Self {
        self.servername = Some(value.into());
        self
    }

    /// Application protocol requested during the handshake
    pub fn alpn(&mut self, value: impl Into<String>) -> Result<&mut Self, ConfigError> {
        self.alpn = Some(validate_alpn(value.into())?);
        Ok(self)
    }

    /// Certificates and cipher preferences for the client context
    pub fn tls(&mut self, value: TlsConfig) -> &mut Self {
        self.tls = value;
        self
    }

    /// Transport parameters advertised to the server
    pub fn transport(&mut self, value: TransportParams) -> Result<&mut Self, ConfigError> {
        value.validate()?;
        self.transport = value;
        Ok(self)
    }

    /// Transport parameters remembered from an earlier session with the server
    pub fn remote_transport_params(&mut self, value: Option<Bytes>) -> &mut Self {
        self.remote_transport_params = value;
        self
    }

    /// Session ticket remembered from an earlier session with the server
    pub fn session_ticket(&mut self, value: Option<Bytes>) -> &mut Self {
        self.session_ticket = value;
        self
    }

    /// Smallest acceptable ephemeral Diffie-Hellman group, in bits
    pub fn min_dh_size(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.min_dh_size = value;
        Ok(self)
    }

    /// Whether to follow the server's preferred address
    pub fn preferred_address_policy(&mut self, value: PreferredAddressPolicy) -> &mut Self {
        self.preferred_address_policy = value;
        self
    }

    /// Check the server certificate against the servername
    pub fn verify_hostname_identity(&mut self, value: bool) -> &mut Self {
        self.verify_hostname_identity = value;
        self
    }

    /// Ask the server to staple an OCSP response
    pub fn request_ocsp(&mut self, value: bool) -> &mut Self {
        self.request_ocsp = value;
        self
    }

    /// Start the handshake as soon as the session exists
    ///
    /// When disabled, call [`Session::start_handshake`](crate::Session::start_handshake).
    pub fn auto_start(&mut self, value: bool) -> &mut Self {
        self.auto_start = value;
        self
    }

    /// Emit qlog records for this session
    pub fn qlog(&mut self, value: bool) -> &mut Self {
        self.qlog = value;
        self
    }

    /// Buffering threshold for streams of this session
    pub fn stream_high_water_mark(&mut self, value: usize) -> &mut Self {
        self.stream_high_water_mark = value;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.alpn.is_none() {
            return Err(ConfigError::IllegalValue("alpn is required"));
        }
        if self.address.is_empty() {
            return Err(ConfigError::IllegalValue("address must not be empty"));
        }
        self.transport.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost".into(),
            port: 0,
            family: AddressFamily::V4,
            servername: None,
            alpn: None,
            tls: TlsConfig::default(),
            transport: TransportParams::default(),
            remote_transport_params: None,
            session_ticket: None,
            min_dh_size: DEFAULT_MIN_DH_SIZE,
            preferred_address_policy: PreferredAddressPolicy::Ignore,
            verify_hostname_identity: true,
            request_ocsp: false,
            auto_start: true,
            qlog: false,
            stream_high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Options for [`Session::open_stream`](crate::Session::open_stream)
#[derive(Debug, Copy, Clone, Default)]
pub struct StreamConfig {
    pub(crate) half_open: bool,
    pub(crate) high_water_mark: Option<usize>,
}

impl StreamConfig {
    /// Open a unidirectional stream rather than a bidirectional one
    pub fn half_open(&mut self, value: bool) -> &mut Self {
        self.half_open = value;
        self
    }

    /// Buffering threshold for this stream; the session's default when unset
    pub fn high_water_mark(&mut self, value: usize) -> &mut Self {
        self.high_water_mark = Some(value);
        self
    }
}

/// QUIC transport parameters advertised to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// Idle period after which the connection is silently closed
    pub max_idle_timeout: Duration,
    /// Connection-wide flow control limit
    pub max_data: u64,
    /// Flow control limit for bidirectional streams we open
    pub max_stream_data_bidi_local: u64,
    /// Flow control limit for bidirectional streams the peer opens
    pub max_stream_data_bidi_remote: u64,
    /// Flow control limit for unidirectional streams
    pub max_stream_data_uni: u64,
    /// Number of bidirectional streams the peer may open
    pub max_streams_bidi: u64,
    /// Number of unidirectional streams the peer may open
    pub max_streams_uni: u64,
    /// Largest delay before acknowledging
    pub max_ack_delay: Duration,
    /// Largest UDP payload accepted
    pub max_packet_size: u16,
    /// Forbid connection migration
    pub disable_active_migration: bool,
    /// Number of connection IDs the peer may keep active
    pub active_connection_id_limit: u32,
}

impl TransportParams {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        // max_ack_delay is an exponent-encoded varint capped at 2^14 ms
        if self.max_ack_delay >= Duration::from_millis(1 << 14) {
            return Err(ConfigError::OutOfBounds);
        }
        if self.max_packet_size < 1200 {
            return Err(ConfigError::OutOfBounds);
        }
        if self.active_connection_id_limit < 2 {
            return Err(ConfigError::OutOfBounds);
        }
        Ok(())
    }
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            max_idle_timeout: Duration::from_secs(10),
            max_data: 1024 * 1024,
            max_stream_data_bidi_local: 256 * 1024,
            max_stream_data_bidi_remote: 256 * 1024,
            max_stream_data_uni: 256 * 1024,
            max_streams_bidi: 100,
            max_streams_uni: 3,
            max_ack_delay: Duration::from_millis(25),
            max_packet_size: 1452,
            disable_active_migration: false,
            active_connection_id_limit: 2,
        }
    }
}

fn validate_alpn(alpn: String) -> Result<String, ConfigError> {
    if alpn.is_empty() || alpn.len() > 255 {
        return Err(ConfigError::IllegalValue("alpn must be between 1 and 255 bytes"));
    }
    Ok(alpn)
}

/// Errors in the configuration of a socket, session or stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
    /// Value is not acceptable for the option
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}
