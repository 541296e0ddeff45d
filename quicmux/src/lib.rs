//! Connection orchestration for QUIC
//!
//! This crate manages the parts of a QUIC stack that sit between an application and a protocol
//! engine: binding UDP endpoints, accepting and initiating sessions, coordinating the TLS
//! handshake, multiplexing streams, and tearing all of it down again in a well-defined order.
//! Packet encoding, loss recovery and the cryptographic record layer are left to a
//! [`TransportEngine`] supplied by the caller, and secure contexts are built by a
//! [`TlsProvider`].
//!
//! The entry point of this crate is the [`Socket`].
//!
//! # Execution model
//!
//! Everything runs on a single thread without locks. A [`Socket`] owns its endpoints, its
//! sessions and, through them, every stream; applications refer to these through copyable
//! handles and operate on them through short-lived accessors obtained from the socket. Work that
//! depends on an external completion (address lookups, engine callbacks) is fed back into the
//! socket with [`Socket::handle_lookup`] and [`Socket::handle_event`]. Notifications are queued
//! in FIFO order and handed out by [`Socket::poll`]; no notification is ever delivered from
//! inside the call that caused it.
//!
//! With the `runtime-tokio` feature, [`Driver`] wires a socket to tokio-based address
//! resolution and an engine event channel.
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

use std::{fmt, ops};

mod config;
mod endpoint;
mod engine;
mod error;
mod event;
mod lookup;
#[cfg(feature = "runtime-tokio")]
mod runtime;
mod session;
mod socket;
mod stats;
mod stream;
mod tls;

pub use crate::config::{
    ClientConfig, ConfigError, EndpointConfig, PreferredAddress, PreferredAddressPolicy,
    ServerConfig, SocketConfig, StreamConfig, TransportParams,
};
pub use crate::endpoint::{Endpoint, EndpointState};
pub use crate::engine::{
    CipherInfo, ClientSessionParams, EngineError, EngineEvent, EphemeralKeyInfo, HandshakeInfo,
    KeyExchange, ListenParams, PathValidationResult, ResetDirections, SocketOptions,
    TransportEngine, VerifyError,
};
pub use crate::error::Error;
pub use crate::event::{Event, SessionEvent, SocketEvent, StreamEvent};
pub use crate::lookup::{AddressFamily, Lookup, LookupToken};
#[cfg(feature = "runtime-tokio")]
pub use crate::lookup::{LookupResult, TokioLookup};
#[cfg(feature = "runtime-tokio")]
pub use crate::runtime::Driver;
pub use crate::session::{Session, SessionPhase};
pub use crate::socket::{Socket, SocketState};
pub use crate::stats::{
    EngineSessionStats, EngineSocketStats, SessionStats, SocketStats, StreamStats,
};
pub use crate::stream::headers::{Header, HeaderError, HeadersKind};
pub use crate::stream::{
    FileSource, Half, ReadError, ResetInfo, SendFileOptions, Stream, StreamPhase,
};
#[cfg(feature = "rustls-ring")]
pub use crate::tls::RustlsProvider;
pub use crate::tls::{SecureContext, SniContexts, TlsConfig, TlsError, TlsProvider};
#[cfg(feature = "rustls-ring")]
pub use rustls;


/// Default buffering threshold, in bytes, for both halves of a stream
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Smallest Diffie-Hellman group size a client accepts unless configured otherwise
pub const DEFAULT_MIN_DH_SIZE: u32 = 1024;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular session
///
/// The two low bits are fixed when the engine allocates the stream: bit 0 names the initiator
/// and bit 1 the directionality.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.dir() {
            Dir::Uni => "uni",
            Dir::Bi => "bi",
        };
        write!(f, "{initiator} {dir}directional stream {}", self.index())
    }
}

impl StreamId {
    /// Construct an identifier from its parts
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }
    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }
    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }
    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

/// Which error space a close code belongs to
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum CloseFamily {
    /// Codes defined by the application protocol
    #[default]
    Application,
    /// QUIC transport error codes
    Transport,
}

impl fmt::Display for CloseFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Application => "application",
            Self::Transport => "transport",
        })
    }
}

/// An error code paired with the space it is interpreted in
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct CloseCode {
    /// The numeric code
    pub code: u64,
    /// The space `code` belongs to
    pub family: CloseFamily,
}

impl CloseCode {
    /// The "no error" code, used when a session closes cleanly
    pub const NO_ERROR: Self = Self {
        code: 0,
        family: CloseFamily::Application,
    };

    /// A code from the application's error space
    pub fn application(code: u64) -> Self {
        Self {
            code,
            family: CloseFamily::Application,
        }
    }

    /// A QUIC transport error code
    pub fn transport(code: u64) -> Self {
        Self {
            code,
            family: CloseFamily::Transport,
        }
    }
}

impl From<u64> for CloseCode {
    fn from(code: u64) -> Self {
        Self::application(code)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} code {}", self.family, self.code)
    }
}

/// Internal identifier for an [`Endpoint`] owned by a [`Socket`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EndpointHandle(pub(crate) u64);

/// Internal identifier for a [`Session`] owned by a [`Socket`]
///
/// Handles are never reused, so a handle whose session has been destroyed keeps referring to
/// nothing rather than to a newer session.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionHandle(pub(crate) u64);

/// Internal identifier for a [`Stream`]
///
/// Unlike [`StreamId`], which is only known once the engine allocates the stream, a handle exists
/// from the moment the stream is requested.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamHandle {
    pub(crate) session: SessionHandle,
    pub(crate) key: u64,
}

impl StreamHandle {
    /// The session that owns this stream
    pub fn session(&self) -> SessionHandle {
        self.session
    }
}

/// Engine-side identifier for a connection
///
/// Allocated by the [`TransportEngine`], either when a client session is created or when the
/// engine reports a new inbound session.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionHandle(pub u64);
