//! Outbound connection bootstrap.
//!
//! The [`Bootstrap`] trait is the platform seam: the factory holds exactly one
//! implementation, chosen at construction. [`TokioBootstrap`] is the portable
//! implementation; it dials IP targets directly, races resolved addresses for
//! domain targets, and connects unix targets by path. The connect timeout is
//! always derived from the pipeline deadline, never configured separately.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::{TcpSocket, TcpStream, UnixStream};
use tracing::{trace, warn, Instrument};

use crate::deadline::ConnectionDeadline;
use crate::resolver::{IpVersion, Resolve};
use crate::select::{RaceError, RaceSet};
use crate::target::Target;
use crate::{BoxFuture, Channel, Error};

/// Hook to adjust socket options before a dial, the portable analogue of a
/// platform transport's parameter configurator.
pub type SocketConfigurator = Arc<dyn Fn(&Socket) -> io::Result<()> + Send + Sync>;

/// Platform-agnostic builder seam for outbound connections.
///
/// Exactly one implementation is selected when the factory is constructed;
/// callers only observe the choice through the error vocabulary.
pub trait Bootstrap: Send + Sync {
    /// Connect to `target`, bounded by `deadline`.
    ///
    /// A deadline already in the past fails with [`Error::ConnectTimeout`]
    /// without attempting any I/O.
    fn connect<'a>(
        &'a self,
        target: &'a Target,
        deadline: ConnectionDeadline,
    ) -> BoxFuture<'a, Result<Channel, Error>>;
}

/// Configuration for the tokio bootstrap.
#[derive(Clone)]
pub struct BootstrapConfig {
    /// The timeout for keep-alive probes on established connections.
    pub keep_alive_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,

    /// The local IPv4 address to bind to.
    pub local_address_ipv4: Option<Ipv4Addr>,

    /// The local IPv6 address to bind to.
    pub local_address_ipv6: Option<Ipv6Addr>,

    /// Open sockets with MPTCP where the platform supports it.
    pub enable_multipath: bool,

    /// Delay between staggered connection attempts when racing resolved
    /// addresses. `None` dials one address at a time.
    pub attempt_delay: Option<Duration>,

    /// Socket option hook, run after the built-in options are applied.
    pub socket_configurator: Option<SocketConfigurator>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Some(Duration::from_secs(90)),
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
            local_address_ipv4: None,
            local_address_ipv6: None,
            enable_multipath: false,
            attempt_delay: Some(Duration::from_millis(250)),
            socket_configurator: None,
        }
    }
}

impl fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .field("nodelay", &self.nodelay)
            .field("reuse_address", &self.reuse_address)
            .field("send_buffer_size", &self.send_buffer_size)
            .field("recv_buffer_size", &self.recv_buffer_size)
            .field("local_address_ipv4", &self.local_address_ipv4)
            .field("local_address_ipv6", &self.local_address_ipv6)
            .field("enable_multipath", &self.enable_multipath)
            .field("attempt_delay", &self.attempt_delay)
            .field(
                "socket_configurator",
                &self.socket_configurator.as_ref().map(|_| ".."),
            )
            .finish()
    }
}

/// The portable bootstrap, dialing over tokio's TCP and unix sockets.
#[derive(Clone)]
pub struct TokioBootstrap {
    config: Arc<BootstrapConfig>,
    resolver: Arc<dyn Resolve>,
}

impl fmt::Debug for TokioBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioBootstrap")
            .field("config", &self.config)
            .finish()
    }
}

impl TokioBootstrap {
    /// Create a bootstrap with the given configuration and resolver.
    pub fn new(config: BootstrapConfig, resolver: Arc<dyn Resolve>) -> Self {
        Self {
            config: Arc::new(config),
            resolver,
        }
    }

    /// Dial a literal socket address.
    async fn connect_to_address(
        &self,
        address: SocketAddr,
        deadline: ConnectionDeadline,
    ) -> Result<TcpStream, Error> {
        let socket = prepare(&address, &self.config)?;

        let span = tracing::trace_span!("connect", remote.addr = %address);
        let connect = socket.connect(address).instrument(span);

        let stream = match tokio::time::timeout_at(deadline.instant(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return Err(Error::from_connect_io(error)),
            Err(_) => {
                trace!(remote.addr = %address, "connection timed out");
                return Err(Error::ConnectTimeout);
            }
        };

        if let Err(error) = stream.set_nodelay(self.config.nodelay) {
            warn!("tcp set_nodelay error: {}", error);
        }

        trace!(remote.addr = %address, "tcp connected");
        Ok(stream)
    }

    /// Resolve a host and race connection attempts against the results.
    async fn connect_to_host_port(
        &self,
        host: &str,
        port: u16,
        deadline: ConnectionDeadline,
    ) -> Result<TcpStream, Error> {
        let mut addrs = self
            .resolver
            .resolve(host.into(), port)
            .await
            .map_err(Error::Io)?;

        if self.config.attempt_delay.is_some() {
            addrs.sort_preferred(IpVersion::from_binding(
                self.config.local_address_ipv4,
                self.config.local_address_ipv6,
            ));
        }

        let mut race = RaceSet::new();
        let mut stagger = Duration::ZERO;
        while let Some(address) = addrs.pop() {
            let delay = stagger;
            race.push(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.connect_to_address(address, deadline).await
            });
            stagger += self.config.attempt_delay.unwrap_or(Duration::ZERO);
        }

        race.finish(|_| true).await.map_err(|error| match error {
            RaceError::Failed(error) => error,
            RaceError::Exhausted => Error::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "exhausted connection candidates",
            )),
        })
    }

    /// Dial a unix domain socket by path.
    async fn connect_to_path(
        &self,
        path: &Path,
        deadline: ConnectionDeadline,
    ) -> Result<UnixStream, Error> {
        match tokio::time::timeout_at(deadline.instant(), UnixStream::connect(path)).await {
            Ok(Ok(stream)) => {
                trace!(path = %path.display(), "unix socket connected");
                Ok(stream)
            }
            Ok(Err(error)) => Err(Error::from_connect_io(error)),
            Err(_) => {
                trace!(path = %path.display(), "unix connection timed out");
                Err(Error::ConnectTimeout)
            }
        }
    }
}

impl Bootstrap for TokioBootstrap {
    fn connect<'a>(
        &'a self,
        target: &'a Target,
        deadline: ConnectionDeadline,
    ) -> BoxFuture<'a, Result<Channel, Error>> {
        Box::pin(async move {
            if deadline.has_passed() {
                return Err(Error::ConnectTimeout);
            }

            match target {
                Target::IpAddress(ip, port) => self
                    .connect_to_address(SocketAddr::new(*ip, *port), deadline)
                    .await
                    .map(Channel::Tcp),
                Target::Domain(host, port) => self
                    .connect_to_host_port(host, *port, deadline)
                    .await
                    .map(Channel::Tcp),
                Target::UnixSocket(path) => self
                    .connect_to_path(path, deadline)
                    .await
                    .map(Channel::Unix),
            }
        })
    }
}

fn open_socket(domain: Domain, multipath: bool) -> io::Result<Socket> {
    if multipath {
        match Socket::new(domain, Type::STREAM, mptcp_protocol()) {
            Ok(socket) => return Ok(socket),
            Err(error) => {
                warn!("mptcp socket open failed, falling back to tcp: {}", error);
            }
        }
    }
    Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
}

#[cfg(target_os = "linux")]
fn mptcp_protocol() -> Option<Protocol> {
    Some(Protocol::MPTCP)
}

#[cfg(not(target_os = "linux"))]
fn mptcp_protocol() -> Option<Protocol> {
    Some(Protocol::TCP)
}

fn bind_local_address(
    socket: &Socket,
    dst_addr: &SocketAddr,
    local_addr_ipv4: &Option<Ipv4Addr>,
    local_addr_ipv6: &Option<Ipv6Addr>,
) -> io::Result<()> {
    match (*dst_addr, local_addr_ipv4, local_addr_ipv6) {
        (SocketAddr::V4(_), Some(addr), _) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        (SocketAddr::V6(_), _, Some(addr)) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        _ => {}
    }

    Ok(())
}

/// Open and configure a socket for `addr`, returning the tokio socket ready
/// to connect.
fn prepare(addr: &SocketAddr, config: &BootstrapConfig) -> Result<TcpSocket, Error> {
    let socket = open_socket(Domain::for_address(*addr), config.enable_multipath)
        .map_err(Error::Io)?;
    trace!("tcp socket opened");

    socket.set_nonblocking(true).map_err(Error::Io)?;

    if let Some(dur) = config.keep_alive_timeout {
        let conf = TcpKeepalive::new().with_time(dur);
        if let Err(error) = socket.set_tcp_keepalive(&conf) {
            warn!("tcp set_keepalive error: {}", error);
        }
    }

    bind_local_address(
        &socket,
        addr,
        &config.local_address_ipv4,
        &config.local_address_ipv6,
    )
    .map_err(Error::Io)?;

    if let Some(configurator) = &config.socket_configurator {
        configurator(&socket).map_err(Error::Io)?;
    }

    let socket = TcpSocket::from_std_stream(socket.into());

    if config.reuse_address {
        if let Err(error) = socket.set_reuseaddr(true) {
            warn!("tcp set_reuse_address error: {}", error);
        }
    }

    if let Some(size) = config.send_buffer_size {
        if let Err(error) = socket.set_send_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_buffer_size error: {}", error);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(error) = socket.set_recv_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_recv_buffer_size error: {}", error);
        }
    }

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::net::TcpListener;

    use crate::resolver::GaiResolver;

    fn bootstrap() -> TokioBootstrap {
        TokioBootstrap::new(BootstrapConfig::default(), Arc::new(GaiResolver::new()))
    }

    #[tokio::test]
    async fn connects_to_ip_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = Target::new("127.0.0.1", port);
        let deadline = ConnectionDeadline::after(Duration::from_secs(5));

        let b = bootstrap();
        let (channel, _accepted) = tokio::join!(b.connect(&target, deadline), async {
            listener.accept().await.unwrap().0
        });

        let channel = channel.unwrap();
        assert!(matches!(channel, Channel::Tcp(_)));
        assert_eq!(
            channel.peer_addr().unwrap().port(),
            port,
        );
    }

    #[tokio::test]
    async fn past_deadline_fails_without_io() {
        let dialed = Arc::new(AtomicUsize::new(0));

        #[derive(Clone)]
        struct CountingResolver(Arc<AtomicUsize>);

        impl tower::Service<Box<str>> for CountingResolver {
            type Response = crate::resolver::SocketAddrs;
            type Error = io::Error;
            type Future = std::future::Ready<Result<Self::Response, io::Error>>;

            fn poll_ready(
                &mut self,
                _: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Result<(), io::Error>> {
                std::task::Poll::Ready(Ok(()))
            }

            fn call(&mut self, _host: Box<str>) -> Self::Future {
                self.0.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok([SocketAddr::from(([127, 0, 0, 1], 9))]
                    .into_iter()
                    .collect()))
            }
        }

        let bootstrap = TokioBootstrap::new(
            BootstrapConfig::default(),
            Arc::new(CountingResolver(dialed.clone())),
        );

        let deadline =
            ConnectionDeadline::at(tokio::time::Instant::now() - Duration::from_secs(1));
        let error = bootstrap
            .connect(&Target::new("example.com", 80), deadline)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::ConnectTimeout));
        assert_eq!(dialed.load(Ordering::SeqCst), 0, "no resolution, no dial");
    }

    #[tokio::test]
    async fn domain_target_uses_resolver() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let calls = Arc::new(AtomicUsize::new(0));

        #[derive(Clone)]
        struct FixedResolver(Arc<AtomicUsize>, u16);

        impl tower::Service<Box<str>> for FixedResolver {
            type Response = crate::resolver::SocketAddrs;
            type Error = io::Error;
            type Future = std::future::Ready<Result<Self::Response, io::Error>>;

            fn poll_ready(
                &mut self,
                _: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Result<(), io::Error>> {
                std::task::Poll::Ready(Ok(()))
            }

            fn call(&mut self, _host: Box<str>) -> Self::Future {
                self.0.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok([SocketAddr::from(([127, 0, 0, 1], self.1))]
                    .into_iter()
                    .collect()))
            }
        }

        let bootstrap = TokioBootstrap::new(
            BootstrapConfig::default(),
            Arc::new(FixedResolver(calls.clone(), port)),
        );

        let target = Target::new("service.internal", 80);
        let deadline = ConnectionDeadline::after(Duration::from_secs(5));

        let (channel, _accepted) = tokio::join!(bootstrap.connect(&target, deadline), async {
            listener.accept().await.unwrap().0
        });

        assert!(channel.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unix_target_connects_by_path() {
        let dir = std::env::temp_dir().join(format!("dialtone-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bootstrap.sock");
        let _ = std::fs::remove_file(&path);

        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let target = Target::UnixSocket(path.clone());
        let deadline = ConnectionDeadline::after(Duration::from_secs(5));

        let b = bootstrap();
        let (channel, _accepted) = tokio::join!(b.connect(&target, deadline), async {
            listener.accept().await.unwrap().0
        });

        assert!(matches!(channel.unwrap(), Channel::Unix(_)));
        let _ = std::fs::remove_file(&path);
    }
}
