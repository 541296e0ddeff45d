use std::{any::Any, fmt, sync::Arc};

use bytes::Bytes;
use thiserror::Error;

use crate::Side;

/// An opaque, cheaply cloneable TLS context handed to the transport engine
///
/// Contexts are produced by a [`TlsProvider`]; the engine that consumes them knows their
/// concrete type and recovers it with [`SecureContext::downcast`].
#[derive(Clone)]
pub struct SecureContext {
    side: Side,
    inner: Arc<dyn Any + Send + Sync>,
}

impl SecureContext {
    /// Wrap a provider-specific context
    pub fn new<T: Any + Send + Sync>(side: Side, inner: Arc<T>) -> Self {
        Self { side, inner }
    }

    /// Whether this context serves or initiates handshakes
    pub fn side(&self) -> Side {
        self.side
    }

    /// Recover the provider-specific context
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.clone().downcast::<T>().ok()
    }

    /// Whether both handles refer to the same context
    pub fn same(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.inner) as *const () == Arc::as_ptr(&other.inner) as *const ()
    }
}

impl fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureContext")
            .field("side", &self.side)
            .finish_non_exhaustive()
    }
}

/// Certificate, key and cipher configuration for building a [`SecureContext`]
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// DER-encoded certificate chain, leaf first
    pub cert_chain: Vec<Bytes>,
    /// DER-encoded PKCS#8 private key for the leaf certificate
    pub key: Option<Bytes>,
    /// DER-encoded trust anchors used to verify the peer
    pub ca: Vec<Bytes>,
    /// Cipher suite names to allow, in the provider's naming; all TLS 1.3 suites when unset
    pub ciphers: Option<Vec<String>>,
    /// Key exchange group names to allow; the provider's defaults when unset
    pub groups: Option<Vec<String>>,
    /// Accept or attempt 0-RTT data
    pub early_data: bool,
}

/// Errors building a secure context
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlsError {
    /// A server context needs a certificate chain
    #[error("no certificate configured")]
    MissingCertificate,
    /// A certificate was configured without its key
    #[error("no private key configured")]
    MissingKey,
    /// The cipher filter excluded every TLS 1.3 suite
    #[error("no usable TLS 1.3 cipher suites")]
    NoCipherSuites,
    /// The group filter excluded every key exchange group
    #[error("no usable key exchange groups")]
    NoKeyExchangeGroups,
    /// The provider rejected the configuration
    #[error("TLS provider error: {0}")]
    Provider(String),
}

/// Builds secure contexts for servers and clients
///
/// Contexts are restricted to TLS 1.3 and carry the QUIC-specific initialization (ALPN, key
/// exchange groups, early data) the engine relies on.
pub trait TlsProvider {
    /// Build the context a listening socket presents to clients
    fn server_context(&self, config: &TlsConfig, alpn: &str) -> Result<SecureContext, TlsError>;
    /// Build the context a client session handshakes with
    fn client_context(&self, config: &TlsConfig, alpn: &str) -> Result<SecureContext, TlsError>;
}

/// Server contexts selected by the name a client asks for
///
/// Patterns are either exact names or `*.` followed by a domain, which matches exactly one
/// additional leading label. The first matching pattern wins.
#[derive(Debug, Clone, Default)]
pub struct SniContexts {
    entries: Vec<(String, SecureContext)>,
}

impl SniContexts {
    /// Add a pattern; earlier patterns take precedence
    pub fn insert(&mut self, pattern: impl Into<String>, context: SecureContext) -> &mut Self {
        self.entries.push((pattern.into().to_ascii_lowercase(), context));
        self
    }

    /// The context for `servername`, if any pattern matches
    pub fn select(&self, servername: &str) -> Option<&SecureContext> {
        let servername = servername.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(pattern, _)| matches_pattern(pattern, &servername))
            .map(|(_, ctx)| ctx)
    }

    /// Number of patterns
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no patterns are configured
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(domain) => match name.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == domain,
            None => false,
        },
        None => pattern == name,
    }
}

/// [`TlsProvider`] backed by rustls and its `ring` crypto provider
#[cfg(feature = "rustls-ring")]
#[derive(Debug, Clone)]
pub struct RustlsProvider {
    crypto: Arc<rustls::crypto::CryptoProvider>,
}

#[cfg(feature = "rustls-ring")]
impl RustlsProvider {
    /// Use the default `ring` crypto provider
    pub fn new() -> Self {
        Self::with_crypto(Arc::new(rustls::crypto::ring::default_provider()))
    }

    /// Use a specific crypto provider
    pub fn with_crypto(crypto: Arc<rustls::crypto::CryptoProvider>) -> Self {
        Self { crypto }
    }

    fn crypto_for(
        &self,
        config: &TlsConfig,
    ) -> Result<Arc<rustls::crypto::CryptoProvider>, TlsError> {
        let mut crypto = (*self.crypto).clone();
        crypto.cipher_suites.retain(|suite| {
            suite.tls13().is_some()
                && match config.ciphers {
                    Some(ref names) => {
                        let name = format!("{:?}", suite.suite());
                        names.iter().any(|n| n.eq_ignore_ascii_case(&name))
                    }
                    None => true,
                }
        });
        if crypto.cipher_suites.is_empty() {
            return Err(TlsError::NoCipherSuites);
        }

        if let Some(ref names) = config.groups {
            crypto.kx_groups.retain(|group| {
                let name = format!("{:?}", group.name());
                names.iter().any(|n| n.eq_ignore_ascii_case(&name))
            });
            if crypto.kx_groups.is_empty() {
                return Err(TlsError::NoKeyExchangeGroups);
            }
        }
        Ok(Arc::new(crypto))
    }
}

#[cfg(feature = "rustls-ring")]
impl Default for RustlsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "rustls-ring")]
impl TlsProvider for RustlsProvider {
    fn server_context(&self, config: &TlsConfig, alpn: &str) -> Result<SecureContext, TlsError> {
        use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

        if config.cert_chain.is_empty() {
            return Err(TlsError::MissingCertificate);
        }
        let key = config.key.as_ref().ok_or(TlsError::MissingKey)?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.to_vec()));

        let mut server = rustls::ServerConfig::builder_with_provider(self.crypto_for(config)?)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(provider_error)?
            .with_no_client_auth()
            .with_single_cert(certificates(config), key)
            .map_err(provider_error)?;
        server.alpn_protocols = vec![alpn.as_bytes().to_vec()];
        if config.early_data {
            server.max_early_data_size = u32::MAX;
        }
        Ok(SecureContext::new(Side::Server, Arc::new(server)))
    }

    fn client_context(&self, config: &TlsConfig, alpn: &str) -> Result<SecureContext, TlsError> {
        use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

        let mut roots = rustls::RootCertStore::empty();
        for der in &config.ca {
            roots
                .add(CertificateDer::from(der.to_vec()))
                .map_err(provider_error)?;
        }

        let builder = rustls::ClientConfig::builder_with_provider(self.crypto_for(config)?)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(provider_error)?
            .with_root_certificates(roots);
        let mut client = match config.key {
            Some(ref key) if !config.cert_chain.is_empty() => {
                let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.to_vec()));
                builder
                    .with_client_auth_cert(certificates(config), key)
                    .map_err(provider_error)?
            }
            _ => builder.with_no_client_auth(),
        };
        client.alpn_protocols = vec![alpn.as_bytes().to_vec()];
        client.enable_early_data = config.early_data;
        Ok(SecureContext::new(Side::Client, Arc::new(client)))
    }
}

#[cfg(feature = "rustls-ring")]
fn certificates(config: &TlsConfig) -> Vec<rustls::pki_types::CertificateDer<'static>> {
    config
        .cert_chain
        .iter()
        .map(|der| rustls::pki_types::CertificateDer::from(der.to_vec()))
        .collect()
}

#[cfg(feature = "rustls-ring")]
fn provider_error(e: rustls::Error) -> TlsError {
    TlsError::Provider(e.to_string())
}
