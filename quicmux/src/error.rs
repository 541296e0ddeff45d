use std::{io, sync::Arc};

use thiserror::Error;

use crate::{
    config::ConfigError, engine::EngineError, stream::headers::HeaderError, tls::TlsError,
    CloseCode,
};

/// Errors raised by socket, session and stream operations
///
/// Synchronous failures (bad state, bad options) are returned directly from the call that
/// detected them. Asynchronous failures tear down the object concerned and are reported through
/// an `Error` notification that always precedes its `Close` notification.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// The object has already been destroyed
    #[error("{op}: {object} has been destroyed")]
    Destroyed {
        /// Kind of object the operation targeted
        object: &'static str,
        /// The rejected operation
        op: &'static str,
    },
    /// The object is closing and no longer accepts this operation
    #[error("{op}: {object} is closing")]
    Closing {
        /// Kind of object the operation targeted
        object: &'static str,
        /// The rejected operation
        op: &'static str,
    },
    /// The operation is not valid in the object's current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Options failed validation
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A header block failed validation
    #[error(transparent)]
    Header(#[from] HeaderError),
    /// The secure context could not be built
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// The peer does not support any QUIC version we offered
    #[error("QUIC session failed version negotiation (version {version:#x}, requested {requested:x?}, supported {supported:x?})")]
    VersionNegotiation {
        /// Version used in the failed attempt
        version: u32,
        /// Versions we requested
        requested: Vec<u32>,
        /// Versions the peer supports
        supported: Vec<u32>,
    },
    /// The server's ephemeral Diffie-Hellman group is smaller than allowed
    #[error("DH parameter size {size} is less than {min}")]
    DhParamSize {
        /// Size offered by the server
        size: u32,
        /// Configured minimum
        min: u32,
    },
    /// The engine could not allocate a stream
    #[error("unable to create QUIC stream")]
    StreamOpenRefused,
    /// The session went away before a deferred stream open could run
    #[error("session closed before the stream was opened")]
    StreamOpenAborted,
    /// Binding an endpoint failed
    #[error("bind failed for {host}:{port}: {source}")]
    Bind {
        /// Address that was being bound
        host: String,
        /// Port that was being bound
        port: u16,
        /// OS error
        source: Arc<io::Error>,
    },
    /// Resolving an address failed
    #[error("lookup of {host} failed: {source}")]
    Lookup {
        /// The name being resolved
        host: String,
        /// Resolver error
        source: Arc<io::Error>,
    },
    /// The transport engine failed an operation
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Destroyed with an explicit close code
    #[error("closed with {0}")]
    Closed(CloseCode),
    /// A socket option could not be applied
    #[error("socket operation failed: {0}")]
    Io(Arc<io::Error>),
    /// Piping a file into a stream failed
    #[error("file transfer failed: {0}")]
    File(Arc<io::Error>),
}

impl Error {
    pub(crate) fn destroyed(object: &'static str, op: &'static str) -> Self {
        Self::Destroyed { object, op }
    }

    pub(crate) fn closing(object: &'static str, op: &'static str) -> Self {
        Self::Closing { object, op }
    }

    /// The close code carried by this error, if it maps onto one
    ///
    /// Used to pick the code sent in CONNECTION_CLOSE when a session is destroyed with an error.
    pub fn close_code(&self) -> Option<CloseCode> {
        match *self {
            Self::Closed(code) => Some(code),
            Self::Engine(EngineError::Protocol { code, family }) => {
                Some(CloseCode { code, family })
            }
            _ => None,
        }
    }
}
