use std::io;

use thiserror::Error;

/// A boxed error, used at seams where the concrete type is not interesting.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while establishing a connection or driving a transaction.
///
/// Every stage of the establishment pipeline fails into this one vocabulary;
/// platform error types are translated at the boundary so callers never see a
/// transport-specific timeout or a handler-missing assertion.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport connect did not complete by the deadline. Also raised
    /// when the deadline was already in the past on entry, before any I/O.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The SOCKSv5 handshake did not complete by the deadline.
    #[error("SOCKS handshake timed out")]
    SocksHandshakeTimeout,

    /// The HTTP CONNECT handshake did not complete by the deadline.
    #[error("HTTP proxy handshake timed out")]
    HttpProxyHandshakeTimeout,

    /// The TLS handshake did not complete by the deadline.
    #[error("TLS handshake timed out")]
    TlsHandshakeTimeout,

    /// The proxy replied with something other than success: a non-2xx CONNECT
    /// status, or a malformed or non-zero SOCKS reply.
    #[error("invalid proxy response: {0}")]
    InvalidProxyResponse(String),

    /// The HTTP proxy replied 407, or SOCKS authentication failed.
    #[error("proxy authentication required")]
    ProxyAuthenticationRequired,

    /// ALPN selected a protocol other than `h2` or `http/1.1`.
    #[error("server offered unsupported application protocol {0:?}")]
    ServerOfferedUnsupportedApplicationProtocol(String),

    /// The channel went inactive before the pipeline finished negotiating.
    #[error("remote connection closed during negotiation")]
    RemoteConnectionClosed,

    /// The transaction was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    /// The transaction deadline fired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The proxy configuration cannot apply to this target.
    #[error("invalid proxy configuration: {0}")]
    InvalidProxyConfiguration(&'static str),

    /// The destination could not be turned into a dialable target.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// A TLS-level failure from the handshake or context compilation.
    #[error("tls: {0}")]
    Tls(#[source] rustls::Error),

    /// A leaf transport failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The HTTP-layer handshake over the negotiated channel failed, or a
    /// debug initializer rejected the channel.
    #[error("handshake: {0}")]
    Handshake(#[source] BoxError),
}

impl Error {
    /// Translate a transport connect error, mapping the platform timeout kind
    /// to [`Error::ConnectTimeout`].
    pub(crate) fn from_connect_io(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::TimedOut {
            Error::ConnectTimeout
        } else {
            Error::Io(error)
        }
    }

    /// True for failures where a dial could plausibly succeed once
    /// connectivity returns.
    pub(crate) fn is_transient_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Io(error) if matches!(
                error.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::AddrNotAvailable
            )
        )
    }
}

// Terminal transaction failures are delivered to up to two waiters (the
// response path and a suspended body write), so the error must be
// duplicable. Sources that are not `Clone` are flattened to their message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::ConnectTimeout => Error::ConnectTimeout,
            Error::SocksHandshakeTimeout => Error::SocksHandshakeTimeout,
            Error::HttpProxyHandshakeTimeout => Error::HttpProxyHandshakeTimeout,
            Error::TlsHandshakeTimeout => Error::TlsHandshakeTimeout,
            Error::InvalidProxyResponse(detail) => Error::InvalidProxyResponse(detail.clone()),
            Error::ProxyAuthenticationRequired => Error::ProxyAuthenticationRequired,
            Error::ServerOfferedUnsupportedApplicationProtocol(name) => {
                Error::ServerOfferedUnsupportedApplicationProtocol(name.clone())
            }
            Error::RemoteConnectionClosed => Error::RemoteConnectionClosed,
            Error::Cancelled => Error::Cancelled,
            Error::DeadlineExceeded => Error::DeadlineExceeded,
            Error::InvalidProxyConfiguration(detail) => Error::InvalidProxyConfiguration(detail),
            Error::InvalidTarget(detail) => Error::InvalidTarget(detail.clone()),
            Error::Tls(error) => Error::Tls(error.clone()),
            Error::Io(error) => Error::Io(io::Error::new(error.kind(), error.to_string())),
            Error::Handshake(error) => Error::Handshake(error.to_string().into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_io_translation() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "too slow");
        assert!(matches!(
            Error::from_connect_io(timeout),
            Error::ConnectTimeout
        ));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert!(matches!(Error::from_connect_io(refused), Error::Io(_)));
    }

    #[test]
    fn clone_preserves_kind() {
        let error = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        match error.clone() {
            Error::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected clone: {other:?}"),
        }
    }
}
