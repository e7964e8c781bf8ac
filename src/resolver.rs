//! Address resolution.
//!
//! Resolvers are [`tower::Service`]s from a host name to a [`SocketAddrs`]
//! collection. The default [`GaiResolver`] asks the operating system via
//! `getaddrinfo` on a blocking worker thread; a custom resolver is any
//! service with the same shape, installed through
//! [`ClientConfig::resolver`][crate::ClientConfig].

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::{fmt, io};

use futures_util::Future;
use pin_project::{pin_project, pinned_drop};
use tokio::task::JoinHandle;
use tower::ServiceExt as _;

use crate::BoxFuture;

/// An ordered collection of resolved socket addresses.
#[derive(Debug, Clone, Default)]
pub struct SocketAddrs(VecDeque<SocketAddr>);

impl SocketAddrs {
    pub(crate) fn set_port(&mut self, port: u16) {
        for addr in &mut self.0 {
            addr.set_port(port)
        }
    }

    pub(crate) fn pop(&mut self) -> Option<SocketAddr> {
        self.0.pop_front()
    }

    /// Whether any addresses were resolved.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of resolved addresses.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Move the first address of the preferred family (and one of the other
    /// family right behind it) to the front, so parallel dialing alternates
    /// families.
    pub(crate) fn sort_preferred(&mut self, prefer: Option<IpVersion>) {
        let mut v4_idx = None;
        let mut v6_idx = None;

        for (idx, addr) in self.0.iter().enumerate() {
            match (addr.version(), v4_idx, v6_idx) {
                (IpVersion::V4, None, _) => {
                    v4_idx = Some(idx);
                }
                (IpVersion::V6, _, None) => {
                    v6_idx = Some(idx);
                }
                (_, Some(_), Some(_)) => break,
                _ => {}
            }
        }

        let v4: Option<SocketAddr>;
        let v6: Option<SocketAddr>;
        if v4_idx.zip(v6_idx).is_some_and(|(v4, v6)| v4 > v6) {
            v4 = v4_idx.and_then(|idx| self.0.remove(idx));
            v6 = v6_idx.and_then(|idx| self.0.remove(idx));
        } else {
            v6 = v6_idx.and_then(|idx| self.0.remove(idx));
            v4 = v4_idx.and_then(|idx| self.0.remove(idx));
        }

        match (prefer, v4, v6) {
            (Some(IpVersion::V4), Some(addr_v4), Some(addr_v6)) => {
                self.0.push_front(addr_v6);
                self.0.push_front(addr_v4);
            }
            (Some(IpVersion::V6), Some(addr_v4), Some(addr_v6)) => {
                self.0.push_front(addr_v4);
                self.0.push_front(addr_v6);
            }
            (_, Some(addr_v4), Some(addr_v6)) => {
                self.0.push_front(addr_v4);
                self.0.push_front(addr_v6);
            }
            (_, Some(addr_v4), None) => {
                self.0.push_front(addr_v4);
            }
            (_, None, Some(addr_v6)) => {
                self.0.push_front(addr_v6);
            }
            _ => {}
        }
    }
}

impl FromIterator<SocketAddr> for SocketAddrs {
    fn from_iter<T: IntoIterator<Item = SocketAddr>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for SocketAddrs {
    type Item = SocketAddr;
    type IntoIter = std::collections::vec_deque::IntoIter<SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// IP version of an address.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpVersion {
    pub(crate) fn from_binding(
        ip_v4_address: Option<Ipv4Addr>,
        ip_v6_address: Option<Ipv6Addr>,
    ) -> Option<Self> {
        match (ip_v4_address, ip_v6_address) {
            // Prefer IPv6 if both are available.
            (Some(_), Some(_)) => Some(Self::V6),
            (Some(_), None) => Some(Self::V4),
            (None, Some(_)) => Some(Self::V6),
            (None, None) => None,
        }
    }
}

/// Extension trait to get the IP version of an address.
pub trait IpVersionExt {
    /// Get the IP version of this address.
    fn version(&self) -> IpVersion;
}

impl IpVersionExt for SocketAddr {
    fn version(&self) -> IpVersion {
        match self {
            SocketAddr::V4(_) => IpVersion::V4,
            SocketAddr::V6(_) => IpVersion::V6,
        }
    }
}

impl IpVersionExt for IpAddr {
    fn version(&self) -> IpVersion {
        match self {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }
}

/// The contract the bootstrap consumes: resolve a host and port to at least
/// one address.
///
/// Blanket-implemented for every cloneable `tower::Service<Box<str>>`
/// resolver, so custom resolvers only implement the service.
pub trait Resolve: Send + Sync {
    /// Resolve `host` to addresses, each carrying `port`.
    fn resolve(&self, host: Box<str>, port: u16) -> BoxFuture<'static, io::Result<SocketAddrs>>;
}

impl<S> Resolve for S
where
    S: tower::Service<Box<str>, Response = SocketAddrs, Error = io::Error>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    fn resolve(&self, host: Box<str>, port: u16) -> BoxFuture<'static, io::Result<SocketAddrs>> {
        let service = self.clone();
        Box::pin(async move {
            let mut addrs = service.oneshot(host).await?;
            addrs.set_port(port);
            if addrs.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "resolver returned no addresses",
                ));
            }
            Ok(addrs)
        })
    }
}

/// GetAddrInfo based resolver.
///
/// This resolver uses the `getaddrinfo` system call to resolve
/// hostnames to IP addresses via the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new `GaiResolver`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl tower::Service<Box<str>> for GaiResolver {
    type Response = SocketAddrs;
    type Error = io::Error;
    type Future = GaiFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, host: Box<str>) -> Self::Future {
        let span = tracing::Span::current();
        JoinHandleFuture {
            handle: tokio::task::spawn_blocking(move || {
                tracing::trace_span!(parent: &span, "getaddrinfo").in_scope(|| {
                    tracing::trace!("dns resolution starting");
                    (host.as_ref(), 0).to_socket_addrs().map(SocketAddrs::from_iter)
                })
            }),
        }
    }
}

/// Future returned by `GaiResolver`, resolving on a blocking worker thread.
#[pin_project(PinnedDrop)]
pub struct JoinHandleFuture<Addr> {
    #[pin]
    handle: JoinHandle<Result<Addr, io::Error>>,
}

impl<Addr> fmt::Debug for JoinHandleFuture<Addr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaiFuture").finish()
    }
}

impl<Addr> Future for JoinHandleFuture<Addr> {
    type Output = Result<Addr, io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().handle.poll(cx)) {
            Ok(Ok(addrs)) => Poll::Ready(Ok(addrs)),
            Ok(Err(error)) => Poll::Ready(Err(error)),
            Err(join_err) => {
                if join_err.is_cancelled() {
                    Poll::Ready(Err(io::Error::new(io::ErrorKind::Interrupted, join_err)))
                } else {
                    Poll::Ready(Err(io::Error::other(join_err)))
                }
            }
        }
    }
}

#[pinned_drop]
impl<Addr> PinnedDrop for JoinHandleFuture<Addr> {
    fn drop(self: Pin<&mut Self>) {
        self.handle.abort()
    }
}

/// A future returned by `GaiResolver` when resolving via getaddrinfo
/// in a worker thread.
pub type GaiFuture = JoinHandleFuture<SocketAddrs>;

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> SocketAddrs {
        list.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn sort_preferred_interleaves_families() {
        let mut resolved = addrs(&["10.0.0.1:80", "10.0.0.2:80", "[::1]:80"]);
        resolved.sort_preferred(Some(IpVersion::V6));
        let order: Vec<SocketAddr> = resolved.into_iter().collect();
        assert_eq!(order[0], "[::1]:80".parse().unwrap());
        assert_eq!(order[1], "10.0.0.1:80".parse().unwrap());
    }

    #[test]
    fn set_port_applies_to_all() {
        let mut resolved = addrs(&["10.0.0.1:0", "[::1]:0"]);
        resolved.set_port(8080);
        assert!(resolved.into_iter().all(|addr| addr.port() == 8080));
    }

    #[tokio::test]
    async fn resolve_rejects_empty_results() {
        #[derive(Clone)]
        struct Empty;

        impl tower::Service<Box<str>> for Empty {
            type Response = SocketAddrs;
            type Error = io::Error;
            type Future = std::future::Ready<Result<SocketAddrs, io::Error>>;

            fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, _host: Box<str>) -> Self::Future {
                std::future::ready(Ok(SocketAddrs::default()))
            }
        }

        let error = Resolve::resolve(&Empty, "example.com".into(), 80)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::AddrNotAvailable);
    }

    #[tokio::test]
    async fn gai_resolves_localhost() {
        let resolved = Resolve::resolve(&GaiResolver::new(), "localhost".into(), 8080)
            .await
            .unwrap();
        assert!(!resolved.is_empty());
        assert!(resolved.into_iter().all(|addr| addr.port() == 8080));
    }
}
