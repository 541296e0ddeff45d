use std::{fmt, net::IpAddr};
#[cfg(feature = "runtime-tokio")]
use std::io;

#[cfg(feature = "runtime-tokio")]
use tokio::sync::mpsc;
#[cfg(feature = "runtime-tokio")]
use tracing::trace;

/// IP version used when resolving and binding
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum AddressFamily {
    /// IPv4
    #[default]
    V4,
    /// IPv6
    V6,
}

impl AddressFamily {
    pub(crate) fn unspecified(self) -> &'static str {
        match self {
            Self::V4 => "0.0.0.0",
            Self::V6 => "::",
        }
    }

    /// Whether `ip` belongs to this family
    pub fn matches(self, ip: &IpAddr) -> bool {
        match self {
            Self::V4 => ip.is_ipv4(),
            Self::V6 => ip.is_ipv6(),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::V4 => "udp4",
            Self::V6 => "udp6",
        })
    }
}

/// Identifies one outstanding address lookup
///
/// Returned to the socket together with the result through
/// [`Socket::handle_lookup`](crate::Socket::handle_lookup).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LookupToken(pub(crate) u64);

/// Address resolution used for endpoint binds, preferred addresses and client connects
///
/// Implementations must not complete synchronously: the result is fed back into the socket
/// later, once the current call has returned.
pub trait Lookup {
    /// Begin resolving `host` to an address of `family`
    fn lookup(&mut self, token: LookupToken, host: &str, family: AddressFamily);
}

/// The outcome of a lookup started by [`TokioLookup`]
#[cfg(feature = "runtime-tokio")]
#[derive(Debug)]
pub struct LookupResult {
    /// The lookup this result belongs to
    pub token: LookupToken,
    /// The first address of the requested family
    pub result: io::Result<IpAddr>,
}

/// Resolves names on the tokio runtime
///
/// Address literals are answered without spawning a task, but still through the channel.
#[cfg(feature = "runtime-tokio")]
#[derive(Debug, Clone)]
pub struct TokioLookup {
    results: mpsc::UnboundedSender<LookupResult>,
}

#[cfg(feature = "runtime-tokio")]
impl TokioLookup {
    /// Create a resolver along with the channel its results arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LookupResult>) {
        let (results, rx) = mpsc::unbounded_channel();
        (Self { results }, rx)
    }
}

#[cfg(feature = "runtime-tokio")]
impl Lookup for TokioLookup {
    fn lookup(&mut self, token: LookupToken, host: &str, family: AddressFamily) {
        if let Ok(ip) = host.parse::<IpAddr>() {
            let result = match family.matches(&ip) {
                true => Ok(ip),
                false => Err(wrong_family(family)),
            };
            // The receiver going away means the driver is gone; nothing is waiting.
            let _ = self.results.send(LookupResult { token, result });
            return;
        }

        trace!(host, %family, "resolving");
        let results = self.results.clone();
        let host = host.to_owned();
        tokio::spawn(async move {
            let result = match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(mut addrs) => addrs
                    .map(|addr| addr.ip())
                    .find(|ip| family.matches(ip))
                    .ok_or_else(|| wrong_family(family)),
                Err(e) => Err(e),
            };
            let _ = results.send(LookupResult { token, result });
        });
    }
}

#[cfg(feature = "runtime-tokio")]
fn wrong_family(family: AddressFamily) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no {family} address found"),
    )
}
