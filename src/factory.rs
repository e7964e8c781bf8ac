//! Connection orchestration.
//!
//! [`ConnectionFactory::make_channel`] composes the establishment stages into
//! one deadline-bound pipeline: dial (direct or to the proxy), negotiate the
//! proxy tunnel when one is configured, then the TLS handshake and ALPN
//! selection for TLS schemes. [`ConnectionFactory::make_connection`] layers
//! the HTTP-layer handshake on top and reports the outcome through
//! [`ConnectionRequester`] callbacks.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, trace, Instrument};

use crate::bootstrap::{Bootstrap, BootstrapConfig, TokioBootstrap};
use crate::channel::{HttpProtocol, NegotiatedProtocol};
use crate::deadline::ConnectionDeadline;
use crate::proxy::{self, ProxyConfig, ProxyKind};
use crate::resolver::{GaiResolver, Resolve};
use crate::target::PoolKey;
use crate::tls::{match_alpn_to_http_version, HttpVersionPolicy, TlsConfig, TlsNegotiator};
use crate::{BoxError, Channel, Error};

/// The request body type HTTP connections accept.
pub type OutboundBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Response decompression policy, passed through to the HTTP layer untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decompression {
    /// Bodies are delivered as received.
    #[default]
    Disabled,
    /// The HTTP layer decompresses response bodies.
    Enabled,
}

/// A hook run on the negotiated channel before the HTTP-layer handshake.
/// A failure fails the connection creation.
pub type DebugInitializer = Arc<dyn Fn(&Channel) -> Result<(), BoxError> + Send + Sync>;

/// Configuration for the connection factory.
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Route `http`/`https` requests through this proxy.
    pub proxy: Option<ProxyConfig>,
    /// Default TLS parameters.
    pub tls: TlsConfig,
    /// Which HTTP versions to advertise during ALPN.
    pub http_version: HttpVersionPolicy,
    /// Transport knobs for the bootstrap, including MPTCP.
    pub bootstrap: BootstrapConfig,
    /// Custom resolver; the platform resolver when unset.
    pub resolver: Option<Arc<dyn Resolve>>,
    /// Retire an HTTP/2 connection after this many uses.
    pub max_uses_per_connection: Option<usize>,
    /// Decompression policy for the HTTP layer.
    pub decompression: Decompression,
    /// Hook run on new HTTP/1.1 channels.
    pub http1_connection_debug_initializer: Option<DebugInitializer>,
    /// Hook run on new HTTP/2 channels.
    pub http2_connection_debug_initializer: Option<DebugInitializer>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("proxy", &self.proxy)
            .field("tls", &self.tls)
            .field("http_version", &self.http_version)
            .field("bootstrap", &self.bootstrap)
            .field("resolver", &self.resolver.as_ref().map(|_| ".."))
            .field("max_uses_per_connection", &self.max_uses_per_connection)
            .field("decompression", &self.decompression)
            .finish_non_exhaustive()
    }
}

/// Callbacks reporting the outcome of [`ConnectionFactory::make_connection`].
pub trait ConnectionRequester: Send + Sync {
    /// An HTTP/1.1 connection is running.
    fn http1_created(&self, connection: Http1Connection);

    /// An HTTP/2 connection is running. `maximum_streams` carries the
    /// configured per-connection use cap, when one is set.
    fn http2_created(&self, connection: Http2Connection, maximum_streams: Option<usize>);

    /// The connection could not be created.
    fn failed_to_create(&self, error: Error);

    /// A dial failed for a reason that may pass once connectivity returns.
    /// Reported before `failed_to_create`.
    fn waiting_for_connectivity(&self, _error: &Error) {}
}

/// A running HTTP/1.1 connection.
pub struct Http1Connection {
    sender: hyper::client::conn::http1::SendRequest<OutboundBody>,
}

impl Http1Connection {
    /// Send a request over the connection.
    pub async fn send_request(
        &mut self,
        request: http::Request<OutboundBody>,
    ) -> Result<http::Response<Incoming>, hyper::Error> {
        self.sender.send_request(request).await
    }

    /// Whether the connection can accept a request now.
    pub fn is_ready(&self) -> bool {
        self.sender.is_ready()
    }
}

impl fmt::Debug for Http1Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Connection")
            .field("version", &http::Version::HTTP_11)
            .finish()
    }
}

/// A running HTTP/2 connection. Clones share the underlying connection and
/// multiplex streams over it.
#[derive(Clone)]
pub struct Http2Connection {
    sender: hyper::client::conn::http2::SendRequest<OutboundBody>,
}

impl Http2Connection {
    /// Send a request over the connection.
    pub async fn send_request(
        &mut self,
        request: http::Request<OutboundBody>,
    ) -> Result<http::Response<Incoming>, hyper::Error> {
        self.sender.send_request(request).await
    }

    /// Whether the connection can accept a request now.
    pub fn is_ready(&self) -> bool {
        self.sender.is_ready()
    }
}

impl fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Connection")
            .field("version", &http::Version::HTTP_2)
            .finish()
    }
}

/// Orchestrates the establishment pipeline.
pub struct ConnectionFactory {
    config: ClientConfig,
    bootstrap: Arc<dyn Bootstrap>,
    tls: TlsNegotiator,
}

impl ConnectionFactory {
    /// Create a factory with the portable tokio bootstrap.
    pub fn new(config: ClientConfig) -> Self {
        let resolver = config
            .resolver
            .clone()
            .unwrap_or_else(|| Arc::new(GaiResolver::new()));
        let bootstrap = Arc::new(TokioBootstrap::new(config.bootstrap.clone(), resolver));
        Self::with_bootstrap(config, bootstrap)
    }

    /// Create a factory over an alternative transport bootstrap.
    pub fn with_bootstrap(config: ClientConfig, bootstrap: Arc<dyn Bootstrap>) -> Self {
        let tls = TlsNegotiator::new(config.http_version);
        Self {
            config,
            bootstrap,
            tls,
        }
    }

    /// Establish a protocol-negotiated channel to the destination.
    ///
    /// The whole pipeline is bounded by `deadline`; a deadline already in the
    /// past fails with [`Error::ConnectTimeout`] before any socket is opened.
    pub async fn make_channel(
        &self,
        key: &PoolKey,
        deadline: ConnectionDeadline,
    ) -> Result<NegotiatedProtocol, Error> {
        if deadline.has_passed() {
            return Err(Error::ConnectTimeout);
        }

        if key.scheme.proxyable() {
            if let Some(proxy) = &self.config.proxy {
                proxy.validate(key)?;
                return self.proxy_pipeline(proxy, key, deadline).await;
            }
        }

        self.direct_pipeline(key, deadline).await
    }

    /// Establish a channel and start the HTTP connection over it, reporting
    /// the outcome to `requester`.
    pub async fn make_connection<R>(
        &self,
        key: &PoolKey,
        connection_id: u64,
        deadline: ConnectionDeadline,
        requester: &R,
    ) where
        R: ConnectionRequester,
    {
        let span = tracing::debug_span!("connection", id = connection_id, peer = %key.target);

        let negotiated = match self.make_channel(key, deadline).instrument(span.clone()).await {
            Ok(negotiated) => negotiated,
            Err(error) => {
                if error.is_transient_connectivity() {
                    requester.waiting_for_connectivity(&error);
                }
                requester.failed_to_create(error);
                return;
            }
        };

        let initializer = match negotiated.protocol() {
            HttpProtocol::Http1 => self.config.http1_connection_debug_initializer.as_ref(),
            HttpProtocol::Http2 => self.config.http2_connection_debug_initializer.as_ref(),
        };
        if let Some(initializer) = initializer {
            if let Err(error) = initializer(negotiated.channel()) {
                requester.failed_to_create(Error::Handshake(error));
                return;
            }
        }

        match negotiated {
            NegotiatedProtocol::Http1(channel) => {
                match handshake_http1(channel).instrument(span).await {
                    Ok(connection) => requester.http1_created(connection),
                    Err(error) => requester.failed_to_create(error),
                }
            }
            NegotiatedProtocol::Http2(channel) => {
                match handshake_http2(channel).instrument(span).await {
                    Ok(connection) => {
                        requester.http2_created(connection, self.config.max_uses_per_connection)
                    }
                    Err(error) => requester.failed_to_create(error),
                }
            }
        }
    }

    async fn direct_pipeline(
        &self,
        key: &PoolKey,
        deadline: ConnectionDeadline,
    ) -> Result<NegotiatedProtocol, Error> {
        trace!(peer = %key.target, "connecting directly");
        let channel = self.bootstrap.connect(&key.target, deadline).await?;

        if key.scheme.uses_tls() {
            self.negotiate_tls(channel, key, deadline).await
        } else {
            Ok(NegotiatedProtocol::Http1(channel))
        }
    }

    async fn proxy_pipeline(
        &self,
        proxy: &ProxyConfig,
        key: &PoolKey,
        deadline: ConnectionDeadline,
    ) -> Result<NegotiatedProtocol, Error> {
        debug!(proxy.host = %proxy.host, proxy.port = proxy.port, peer = %key.target, "connecting via proxy");
        let channel = self.bootstrap.connect(&proxy.target(), deadline).await?;

        let channel = match proxy.kind {
            ProxyKind::Http => {
                let authority = key
                    .target
                    .authority()
                    .expect("proxyable targets carry an authority");
                proxy::connect::handshake(
                    channel,
                    &authority,
                    proxy.authorization.as_ref(),
                    deadline,
                )
                .await?
            }
            ProxyKind::Socks5 => {
                proxy::socks::handshake(
                    channel,
                    &key.target,
                    proxy.authorization.as_ref(),
                    deadline,
                )
                .await?
            }
        };

        if key.scheme.uses_tls() {
            self.negotiate_tls(channel, key, deadline).await
        } else {
            // Cleartext HTTP/2 upgrade through a proxy is out of scope.
            Ok(NegotiatedProtocol::Http1(channel))
        }
    }

    async fn negotiate_tls(
        &self,
        channel: Channel,
        key: &PoolKey,
        deadline: ConnectionDeadline,
    ) -> Result<NegotiatedProtocol, Error> {
        let (channel, alpn) = self
            .tls
            .handshake(channel, &self.config.tls, key, deadline)
            .await?;

        match match_alpn_to_http_version(alpn.as_deref())? {
            HttpProtocol::Http1 => Ok(NegotiatedProtocol::Http1(channel)),
            HttpProtocol::Http2 => Ok(NegotiatedProtocol::Http2(channel)),
        }
    }
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn handshake_http1(channel: Channel) -> Result<Http1Connection, Error> {
    trace!("handshake h1");
    let (sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake::<_, OutboundBody>(TokioIo::new(channel))
        .await
        .map_err(|error| Error::Handshake(error.into()))?;
    tokio::spawn(async {
        if let Err(err) = conn.await {
            tracing::error!(%err, "h1 connection driver error");
        }
    });
    trace!("handshake complete");
    Ok(Http1Connection { sender })
}

async fn handshake_http2(channel: Channel) -> Result<Http2Connection, Error> {
    trace!("handshake h2");
    let (sender, conn) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
        .handshake::<_, OutboundBody>(TokioIo::new(channel))
        .await
        .map_err(|error| Error::Handshake(error.into()))?;
    tokio::spawn(async {
        if let Err(err) = conn.await {
            if err.is_user() {
                tracing::error!(%err, "h2 connection driver error");
            } else {
                tracing::debug!(%err, "h2 connection driver error");
            }
        }
    });
    trace!("handshake complete");
    Ok(Http2Connection { sender })
}
