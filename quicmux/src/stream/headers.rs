//! Header blocks carried on streams
//!
//! The core does not interpret headers beyond the pseudo-header and connection-specific rules
//! shared by HTTP/2 and HTTP/3; encoding them is up to the engine.

use bytes::Bytes;
use thiserror::Error;

/// A single header field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Field name; lowercased by validation
    pub name: String,
    /// Field value
    pub value: Bytes,
}

impl Header {
    /// Construct a header field
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn is_pseudo(&self) -> bool {
        self.name.starts_with(':')
    }
}

/// Which header block of a stream
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeadersKind {
    /// 1xx responses preceding the initial block
    Informational,
    /// The request or response head
    Initial,
    /// Trailers following the body
    Trailing,
}

/// Reasons a header block is rejected
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Empty name or a character not allowed in a field name
    #[error("invalid header name {0:?}")]
    InvalidName(String),
    /// The value of this field contains CR, LF or NUL
    #[error("invalid value for header {0:?}")]
    InvalidValue(String),
    /// A pseudo-header not allowed in this block
    #[error("pseudo-header {0:?} is not allowed here")]
    InvalidPseudoHeader(String),
    /// A pseudo-header given more than once
    #[error("duplicate pseudo-header {0:?}")]
    DuplicatePseudoHeader(String),
    /// A connection-specific field, forbidden in HTTP/2 and HTTP/3
    #[error("connection-specific header {0:?} is not allowed")]
    ConnectionSpecific(String),
}

/// Which pseudo-headers a block may carry
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PseudoRules {
    Request,
    Response,
    Trailer,
}

impl PseudoRules {
    fn allows(self, name: &str) -> bool {
        match self {
            Self::Request => matches!(
                name,
                ":method" | ":scheme" | ":authority" | ":path" | ":protocol"
            ),
            Self::Response => name == ":status",
            Self::Trailer => false,
        }
    }
}

const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "http2-settings",
];

/// Normalize and check a header block
///
/// Names are lowercased and pseudo-headers moved ahead of regular fields, keeping their
/// relative order.
pub(crate) fn validate(headers: &[Header], rules: PseudoRules) -> Result<Vec<Header>, HeaderError> {
    let mut pseudo = Vec::new();
    let mut regular = Vec::with_capacity(headers.len());
    for header in headers {
        let header = Header {
            name: header.name.to_ascii_lowercase(),
            value: header.value.clone(),
        };
        check_name(&header)?;
        if header.value.iter().any(|&b| matches!(b, b'\r' | b'\n' | 0)) {
            return Err(HeaderError::InvalidValue(header.name));
        }

        if header.is_pseudo() {
            if !rules.allows(&header.name) {
                return Err(HeaderError::InvalidPseudoHeader(header.name));
            }
            if pseudo.iter().any(|h: &Header| h.name == header.name) {
                return Err(HeaderError::DuplicatePseudoHeader(header.name));
            }
            pseudo.push(header);
            continue;
        }

        if CONNECTION_SPECIFIC.contains(&header.name.as_str())
            || (header.name == "te" && &header.value[..] != b"trailers")
        {
            return Err(HeaderError::ConnectionSpecific(header.name));
        }
        regular.push(header);
    }
    pseudo.append(&mut regular);
    Ok(pseudo)
}

fn check_name(header: &Header) -> Result<(), HeaderError> {
    let name = header.name.strip_prefix(':').unwrap_or(&header.name);
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b':');
    match valid {
        true => Ok(()),
        false => Err(HeaderError::InvalidName(header.name.clone())),
    }
}
