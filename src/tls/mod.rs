//! TLS configuration, context compilation, and handshake negotiation.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::trace;

use crate::channel::HttpProtocol;
use crate::deadline::ConnectionDeadline;
use crate::target::{PoolKey, Target};
use crate::{Channel, Error};

mod cache;

pub use cache::SslContextCache;

/// Certificate verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CertificateVerification {
    /// Verify the server certificate against the trust roots.
    #[default]
    Verify,
    /// Accept any certificate. Only for test rigs and debugging.
    DangerouslyDisableVerification,
}

/// Trust anchors for server certificate verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TrustRoots {
    /// The platform's native certificate store.
    #[default]
    Native,
    /// An explicit set of DER-encoded root certificates.
    Custom(Vec<Vec<u8>>),
}

/// A client certificate chain and its PKCS#8 private key, DER-encoded.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    /// The certificate chain, leaf first.
    pub cert_chain_der: Vec<Vec<u8>>,
    /// The private key.
    pub key_der: Vec<u8>,
}

// The private key stays out of logs.
impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_chain_der", &self.cert_chain_der.len())
            .finish_non_exhaustive()
    }
}

/// Minimum or maximum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

/// Structural TLS configuration.
///
/// Two configurations that compare equal compile to the same shared context;
/// the [`SslContextCache`] keys on this value, never on object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TlsConfig {
    /// Certificate verification policy.
    pub verification: CertificateVerification,
    /// Trust anchors.
    pub roots: TrustRoots,
    /// Client certificate, when the server requires one.
    pub identity: Option<ClientIdentity>,
    /// Lowest acceptable protocol version.
    pub min_version: Option<TlsVersion>,
    /// Highest acceptable protocol version.
    pub max_version: Option<TlsVersion>,
    /// Caller-requested ALPN protocols. Overridden by the connection factory
    /// for HTTP use; see [`HttpVersionPolicy`].
    pub alpn: Vec<Vec<u8>>,
}

impl TlsConfig {
    /// A stable structural fingerprint, for embedding in a
    /// [`PoolKey`][crate::PoolKey].
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::hash::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Which HTTP versions the client advertises during ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HttpVersionPolicy {
    /// Advertise HTTP/2 and HTTP/1.1, letting the server pick.
    #[default]
    Auto,
    /// Advertise HTTP/1.1 only.
    Http1Only,
}

impl HttpVersionPolicy {
    /// The ALPN protocols to advertise, in preference order.
    pub(crate) fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        match self {
            HttpVersionPolicy::Auto => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            HttpVersionPolicy::Http1Only => vec![b"http/1.1".to_vec()],
        }
    }
}

/// Map a negotiated ALPN protocol to the HTTP version to speak.
///
/// No ALPN and `http/1.1` select HTTP/1.1; `h2` selects HTTP/2; anything else
/// is a failure.
pub(crate) fn match_alpn_to_http_version(alpn: Option<&[u8]>) -> Result<HttpProtocol, Error> {
    match alpn {
        None | Some(b"http/1.1") => Ok(HttpProtocol::Http1),
        Some(b"h2") => Ok(HttpProtocol::Http2),
        Some(other) => Err(Error::ServerOfferedUnsupportedApplicationProtocol(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

/// Performs TLS handshakes with contexts drawn from the shared cache.
#[derive(Debug, Clone)]
pub struct TlsNegotiator {
    cache: SslContextCache,
    policy: HttpVersionPolicy,
}

impl TlsNegotiator {
    /// Create a negotiator advertising ALPN per `policy`, drawing contexts
    /// from the process-wide cache.
    pub fn new(policy: HttpVersionPolicy) -> Self {
        Self {
            cache: SslContextCache::shared(),
            policy,
        }
    }

    /// Wrap `channel` in TLS, bounded by the pipeline deadline.
    ///
    /// Returns the TLS channel and the negotiated ALPN protocol, if any.
    pub(crate) async fn handshake(
        &self,
        channel: Channel,
        config: &TlsConfig,
        key: &PoolKey,
        deadline: ConnectionDeadline,
    ) -> Result<(Channel, Option<Vec<u8>>), Error> {
        let mut config = config.clone();
        config.alpn = self.policy.alpn_protocols();
        let context = self.cache.get_or_compile(&config).await?;

        let server_name = server_name_for(key)?;
        let connector = tokio_rustls::TlsConnector::from(context);

        if deadline.has_passed() {
            return Err(Error::TlsHandshakeTimeout);
        }

        let stream = match tokio::time::timeout_at(
            deadline.instant(),
            connector.connect(server_name, channel),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return Err(translate_handshake_error(error)),
            // The channel is owned by the cancelled future and closes with it.
            Err(_) => {
                trace!("tls handshake timed out");
                return Err(Error::TlsHandshakeTimeout);
            }
        };

        let alpn = stream.get_ref().1.alpn_protocol().map(|proto| proto.to_vec());
        trace!(alpn = ?alpn.as_deref().map(String::from_utf8_lossy), "tls established");

        Ok((Channel::Tls(Box::new(stream)), alpn))
    }
}

/// The TLS server name: the SNI override when present, else the target
/// domain. IP-literal targets use the address form, which advertises no SNI.
fn server_name_for(key: &PoolKey) -> Result<ServerName<'static>, Error> {
    if let Some(name) = key.server_name() {
        return ServerName::try_from(name.to_owned())
            .map_err(|_| Error::InvalidTarget(format!("invalid TLS server name {name:?}")));
    }

    match &key.target {
        Target::IpAddress(ip, _) => Ok(ServerName::from(*ip)),
        Target::UnixSocket(path) => Err(Error::InvalidTarget(format!(
            "TLS over the unix socket {} requires an SNI override",
            path.display()
        ))),
        Target::Domain(..) => unreachable!("domains resolve through server_name()"),
    }
}

fn translate_handshake_error(error: std::io::Error) -> Error {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        return Error::RemoteConnectionClosed;
    }
    match error.downcast::<rustls::Error>() {
        Ok(tls) => Error::Tls(tls),
        Err(error) => Error::Io(error),
    }
}

/// Compile a structural configuration into a rustls context.
pub(crate) fn compile(config: &TlsConfig) -> Result<rustls::ClientConfig, Error> {
    let versions = protocol_versions(config.min_version, config.max_version);
    if versions.is_empty() {
        return Err(Error::Tls(rustls::Error::General(
            "no TLS protocol versions between the configured minimum and maximum".into(),
        )));
    }
    let builder = rustls::ClientConfig::builder_with_protocol_versions(&versions);

    let builder = match config.verification {
        CertificateVerification::Verify => {
            let mut roots = RootCertStore::empty();
            match &config.roots {
                TrustRoots::Native => {
                    for cert in rustls_native_certs::load_native_certs().map_err(Error::Io)? {
                        roots.add(cert).map_err(Error::Tls)?;
                    }
                }
                TrustRoots::Custom(ders) => {
                    for der in ders {
                        roots
                            .add(CertificateDer::from(der.clone()))
                            .map_err(Error::Tls)?;
                    }
                }
            }
            builder.with_root_certificates(roots)
        }
        CertificateVerification::DangerouslyDisableVerification => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification::new())),
    };

    let mut compiled = match &config.identity {
        Some(identity) => {
            let chain = identity
                .cert_chain_der
                .iter()
                .map(|der| CertificateDer::from(der.clone()))
                .collect();
            let key = PrivateKeyDer::try_from(identity.key_der.clone())
                .map_err(|message| Error::Tls(rustls::Error::General(message.into())))?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(Error::Tls)?
        }
        None => builder.with_no_client_auth(),
    };

    compiled.alpn_protocols = config.alpn.clone();
    Ok(compiled)
}

fn protocol_versions(
    min: Option<TlsVersion>,
    max: Option<TlsVersion>,
) -> Vec<&'static rustls::SupportedProtocolVersion> {
    let keep = |version: TlsVersion| {
        min.map_or(true, |lowest| version >= lowest) && max.map_or(true, |highest| version <= highest)
    };

    let mut versions = Vec::with_capacity(2);
    if keep(TlsVersion::Tls12) {
        versions.push(&rustls::version::TLS12);
    }
    if keep(TlsVersion::Tls13) {
        versions.push(&rustls::version::TLS13);
    }
    versions
}

/// Accepts every certificate. Installed only by
/// [`CertificateVerification::DangerouslyDisableVerification`].
#[derive(Debug)]
struct NoVerification {
    provider: rustls::crypto::CryptoProvider,
}

impl NoVerification {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::Scheme;

    #[test]
    fn alpn_policy_never_offers_h2_for_http1_only() {
        assert_eq!(
            HttpVersionPolicy::Auto.alpn_protocols(),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert_eq!(
            HttpVersionPolicy::Http1Only.alpn_protocols(),
            vec![b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn alpn_matching() {
        assert_eq!(
            match_alpn_to_http_version(None).unwrap(),
            HttpProtocol::Http1
        );
        assert_eq!(
            match_alpn_to_http_version(Some(b"http/1.1")).unwrap(),
            HttpProtocol::Http1
        );
        assert_eq!(
            match_alpn_to_http_version(Some(b"h2")).unwrap(),
            HttpProtocol::Http2
        );
        assert!(matches!(
            match_alpn_to_http_version(Some(b"spdy/3")),
            Err(Error::ServerOfferedUnsupportedApplicationProtocol(name)) if name == "spdy/3"
        ));
    }

    #[test]
    fn fingerprint_is_structural() {
        let a = TlsConfig::default();
        let b = TlsConfig::default();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = TlsConfig {
            min_version: Some(TlsVersion::Tls13),
            ..TlsConfig::default()
        };
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn protocol_version_bounds() {
        assert_eq!(protocol_versions(None, None).len(), 2);
        assert_eq!(
            protocol_versions(Some(TlsVersion::Tls13), None),
            vec![&rustls::version::TLS13]
        );
        assert_eq!(
            protocol_versions(None, Some(TlsVersion::Tls12)),
            vec![&rustls::version::TLS12]
        );
    }

    #[test]
    fn server_name_prefers_override() {
        let key = PoolKey {
            scheme: Scheme::Https,
            target: Target::new("10.0.0.1", 443),
            sni_override: Some("api.example.com".into()),
            tls_fingerprint: None,
        };
        assert!(matches!(
            server_name_for(&key).unwrap(),
            ServerName::DnsName(name) if name.as_ref() == "api.example.com"
        ));
    }

    #[test]
    fn ip_targets_use_address_names() {
        let key = PoolKey {
            scheme: Scheme::Https,
            target: Target::new("10.0.0.1", 443),
            sni_override: None,
            tls_fingerprint: None,
        };
        assert!(matches!(
            server_name_for(&key).unwrap(),
            ServerName::IpAddress(_)
        ));
    }

    #[test]
    fn compile_disabled_verification() {
        let config = TlsConfig {
            verification: CertificateVerification::DangerouslyDisableVerification,
            ..TlsConfig::default()
        };
        assert!(compile(&config).is_ok());
    }
}
