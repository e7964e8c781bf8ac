//! Destination normalization: schemes, targets, and pool keys.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::Error;

/// The connection scheme of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plaintext HTTP over TCP.
    Http,
    /// HTTP over TLS over TCP.
    Https,
    /// Plaintext HTTP over a unix domain socket.
    HttpUnix,
    /// HTTP over TLS over a unix domain socket.
    HttpsUnix,
    /// A raw unix domain socket destination.
    Unix,
}

impl Scheme {
    /// Whether connections with this scheme perform a TLS handshake.
    pub fn uses_tls(&self) -> bool {
        matches!(self, Scheme::Https | Scheme::HttpsUnix)
    }

    /// Whether connections with this scheme may be routed through a proxy.
    pub fn proxyable(&self) -> bool {
        matches!(self, Scheme::Http | Scheme::Https)
    }

    /// The default port for this scheme, when it has one.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Scheme::Http => Some(80),
            Scheme::Https => Some(443),
            Scheme::HttpUnix | Scheme::HttpsUnix | Scheme::Unix => None,
        }
    }

    /// The canonical scheme string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::HttpUnix => "http+unix",
            Scheme::HttpsUnix => "https+unix",
            Scheme::Unix => "unix",
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "http+unix" => Ok(Scheme::HttpUnix),
            "https+unix" => Ok(Scheme::HttpsUnix),
            "unix" => Ok(Scheme::Unix),
            other => Err(Error::InvalidTarget(format!("unsupported scheme {other:?}"))),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized destination: an address, a name to resolve, or a socket path.
///
/// `Domain` never holds an IP literal; dotted-quad and bracketed IPv6 hosts
/// are detected at construction and become `IpAddress`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// A literal IP address and port; resolution is skipped.
    IpAddress(IpAddr, u16),
    /// A DNS name (lowercased ASCII) and port.
    Domain(Box<str>, u16),
    /// A filesystem socket path.
    UnixSocket(PathBuf),
}

impl Target {
    /// Build a target from a URI host and port.
    pub fn new(host: &str, port: u16) -> Self {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            Target::IpAddress(ip, port)
        } else {
            Target::Domain(host.to_ascii_lowercase().into(), port)
        }
    }

    /// The domain name, for domain targets.
    pub fn host(&self) -> Option<&str> {
        match self {
            Target::Domain(host, _) => Some(host),
            Target::IpAddress(..) | Target::UnixSocket(_) => None,
        }
    }

    /// The port, for network targets.
    pub fn port(&self) -> Option<u16> {
        match self {
            Target::IpAddress(_, port) | Target::Domain(_, port) => Some(*port),
            Target::UnixSocket(_) => None,
        }
    }

    /// The socket path, for unix targets.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Target::UnixSocket(path) => Some(path),
            Target::IpAddress(..) | Target::Domain(..) => None,
        }
    }

    /// The `host:port` authority form, bracketing IPv6 literals.
    pub fn authority(&self) -> Option<String> {
        match self {
            Target::IpAddress(IpAddr::V6(ip), port) => Some(format!("[{ip}]:{port}")),
            Target::IpAddress(IpAddr::V4(ip), port) => Some(format!("{ip}:{port}")),
            Target::Domain(host, port) => Some(format!("{host}:{port}")),
            Target::UnixSocket(_) => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::UnixSocket(path) => write!(f, "{}", path.display()),
            other => f.write_str(other.authority().as_deref().unwrap_or("")),
        }
    }
}

/// Identity of a reusable connection.
///
/// Two requests may share a pooled connection exactly when their keys are
/// equal; path, query, headers, and body never participate. The SNI override
/// is preserved separately from the target so a caller can dial
/// `10.0.0.1:443` while presenting `api.example.com`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// The connection scheme.
    pub scheme: Scheme,
    /// The dial target.
    pub target: Target,
    /// Explicit TLS server name, overriding the target host.
    pub sni_override: Option<Box<str>>,
    /// Structural fingerprint of a non-default TLS configuration.
    pub tls_fingerprint: Option<u64>,
}

impl PoolKey {
    /// Build a pool key from a request URI.
    ///
    /// Unix schemes carry the percent-encoded socket path in the URI
    /// authority, e.g. `http+unix://%2Fvar%2Frun%2Fapi.sock/status`.
    pub fn from_uri(
        uri: &http::Uri,
        sni_override: Option<&str>,
        tls_fingerprint: Option<u64>,
    ) -> Result<Self, Error> {
        let scheme: Scheme = uri
            .scheme_str()
            .ok_or_else(|| Error::InvalidTarget(format!("missing scheme in {uri}")))?
            .parse()?;

        let target = match scheme {
            Scheme::HttpUnix | Scheme::HttpsUnix | Scheme::Unix => {
                let authority = uri
                    .authority()
                    .ok_or_else(|| Error::InvalidTarget(format!("missing socket path in {uri}")))?;
                let path = percent_decode(authority.as_str())?;
                Target::UnixSocket(PathBuf::from(path))
            }
            Scheme::Http | Scheme::Https => {
                let host = uri
                    .host()
                    .ok_or_else(|| Error::InvalidTarget(format!("missing host in {uri}")))?;
                let port = uri
                    .port_u16()
                    .or_else(|| scheme.default_port())
                    .ok_or_else(|| Error::InvalidTarget(format!("missing port in {uri}")))?;
                Target::new(host, port)
            }
        };

        Ok(Self {
            scheme,
            target,
            sni_override: sni_override.map(|sni| sni.to_ascii_lowercase().into()),
            tls_fingerprint,
        })
    }

    /// The TLS server name: the SNI override when present, else the domain.
    ///
    /// IP-literal targets yield `None`; they present no name.
    pub fn server_name(&self) -> Option<&str> {
        self.sni_override.as_deref().or_else(|| self.target.host())
    }
}

fn percent_decode(encoded: &str) -> Result<String, Error> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|pair| std::str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| {
                        Error::InvalidTarget(format!("invalid percent-encoding in {encoded:?}"))
                    })?;
                decoded.push(hex);
                i += 3;
            }
            byte => {
                decoded.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8(decoded)
        .map_err(|_| Error::InvalidTarget(format!("socket path is not UTF-8 in {encoded:?}")))
}
