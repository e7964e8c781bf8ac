//! Proxy configuration and handshakes.
//!
//! Both sub-protocols share one contract: given an established plain channel
//! to the proxy, perform a handshake whose success yields an end-to-end
//! tunnel to the real target. Each negotiator runs under its own deadline
//! derived from the pipeline deadline; a timer that fires closes the channel
//! and fails with the stage's timeout error.

use std::fmt;

use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;

use crate::target::{PoolKey, Target};
use crate::Error;

pub(crate) mod connect;
pub(crate) mod socks;

/// The proxy protocol to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// HTTP `CONNECT` tunneling.
    Http,
    /// SOCKS protocol version 5.
    Socks5,
}

/// Credentials presented to the proxy.
#[derive(Clone, PartialEq, Eq)]
pub enum Authorization {
    /// Username and password, for `Proxy-Authorization: Basic` and the
    /// SOCKS5 username/password sub-negotiation.
    Basic {
        /// The username.
        username: String,
        /// The password.
        password: String,
    },
    /// A bearer token, valid for HTTP proxies only.
    Bearer(String),
}

impl Authorization {
    /// The `Proxy-Authorization` header value.
    pub(crate) fn header_value(&self) -> String {
        match self {
            Authorization::Basic { username, password } => {
                let credentials = BASE64_STANDARD.encode(format!("{username}:{password}"));
                format!("Basic {credentials}")
            }
            Authorization::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

// Credentials stay out of logs.
impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authorization::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Authorization::Bearer(_) => f.debug_tuple("Bearer").finish(),
        }
    }
}

/// Where and how to reach the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// The proxy protocol.
    pub kind: ProxyKind,
    /// The proxy host.
    pub host: Box<str>,
    /// The proxy port.
    pub port: u16,
    /// Credentials, if the proxy requires them.
    pub authorization: Option<Authorization>,
}

impl ProxyConfig {
    /// An HTTP `CONNECT` proxy.
    pub fn http(host: impl Into<Box<str>>, port: u16) -> Self {
        Self {
            kind: ProxyKind::Http,
            host: host.into(),
            port,
            authorization: None,
        }
    }

    /// A SOCKSv5 proxy.
    pub fn socks5(host: impl Into<Box<str>>, port: u16) -> Self {
        Self {
            kind: ProxyKind::Socks5,
            host: host.into(),
            port,
            authorization: None,
        }
    }

    /// Attach credentials.
    pub fn with_authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = Some(authorization);
        self
    }

    /// The dial target of the proxy itself.
    pub(crate) fn target(&self) -> Target {
        Target::new(&self.host, self.port)
    }

    /// Reject combinations the protocols cannot express before any I/O.
    pub(crate) fn validate(&self, key: &PoolKey) -> Result<(), Error> {
        if matches!(key.target, Target::UnixSocket(_)) {
            return Err(Error::InvalidProxyConfiguration(
                "unix socket targets cannot be proxied",
            ));
        }
        if self.kind == ProxyKind::Socks5
            && matches!(self.authorization, Some(Authorization::Bearer(_)))
        {
            return Err(Error::InvalidProxyConfiguration(
                "SOCKS5 proxies do not support bearer tokens",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::Scheme;

    #[test]
    fn basic_authorization_header_value() {
        let auth = Authorization::Basic {
            username: "Aladdin".into(),
            password: "open sesame".into(),
        };
        assert_eq!(
            auth.header_value(),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn bearer_authorization_header_value() {
        let auth = Authorization::Bearer("token-123".into());
        assert_eq!(auth.header_value(), "Bearer token-123");
    }

    #[test]
    fn debug_redacts_credentials() {
        let auth = Authorization::Basic {
            username: "user".into(),
            password: "hunter2".into(),
        };
        let debugged = format!("{auth:?}");
        assert!(!debugged.contains("hunter2"), "{debugged}");

        let auth = Authorization::Bearer("secret".into());
        assert!(!format!("{auth:?}").contains("secret"));
    }

    #[test]
    fn socks_rejects_bearer_tokens() {
        let proxy = ProxyConfig::socks5("proxy.internal", 1080)
            .with_authorization(Authorization::Bearer("nope".into()));
        let key = PoolKey {
            scheme: Scheme::Http,
            target: Target::new("example.com", 80),
            sni_override: None,
            tls_fingerprint: None,
        };
        assert!(matches!(
            proxy.validate(&key),
            Err(Error::InvalidProxyConfiguration(_))
        ));
    }

    #[test]
    fn proxies_reject_unix_targets() {
        let proxy = ProxyConfig::socks5("proxy.internal", 1080);
        let key = PoolKey {
            scheme: Scheme::Unix,
            target: Target::UnixSocket("/tmp/api.sock".into()),
            sni_override: None,
            tls_fingerprint: None,
        };
        assert!(matches!(
            proxy.validate(&key),
            Err(Error::InvalidProxyConfiguration(_))
        ));
    }
}
