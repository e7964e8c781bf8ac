//! The established byte channel and its negotiated protocol.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// An established, ordered, bidirectional byte stream.
///
/// Effectively implements enum-dispatch for [`AsyncRead`] and [`AsyncWrite`]
/// around the stream types a pipeline can produce. TLS wraps the channel
/// itself, so a tunnelled TLS session reads `Tls(Rewound(Tcp))` after a proxy
/// handshake that over-read into the tunnel.
#[derive(Debug)]
pub enum Channel {
    /// A TCP connection.
    Tcp(TcpStream),
    /// A unix domain socket connection.
    Unix(UnixStream),
    /// A TLS session over an inner channel.
    Tls(Box<tokio_rustls::client::TlsStream<Channel>>),
    /// An inner channel with buffered bytes replayed ahead of it.
    Rewound(Rewind<Box<Channel>>),
}

macro_rules! dispatch {
    ($self:ident.$method:ident($($args:expr),+)) => {
        match $self.get_mut() {
            Channel::Tcp(stream) => Pin::new(stream).$method($($args),+),
            Channel::Unix(stream) => Pin::new(stream).$method($($args),+),
            Channel::Tls(stream) => Pin::new(stream.as_mut()).$method($($args),+),
            Channel::Rewound(stream) => Pin::new(stream).$method($($args),+),
        }
    };
}

impl Channel {
    /// Replay `prefix` ahead of this channel's remaining bytes.
    pub(crate) fn rewound(self, prefix: Bytes) -> Channel {
        if prefix.is_empty() {
            self
        } else {
            Channel::Rewound(Rewind::new(Box::new(self), prefix))
        }
    }

    /// Whether a TLS session has been negotiated on this channel.
    pub fn is_tls(&self) -> bool {
        matches!(self, Channel::Tls(_))
    }

    /// The remote address, for network channels.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Channel::Tcp(stream) => stream.peer_addr().ok(),
            Channel::Unix(_) => None,
            Channel::Tls(stream) => stream.get_ref().0.peer_addr(),
            Channel::Rewound(rewind) => rewind.inner.peer_addr(),
        }
    }

    /// The ALPN protocol the TLS layer negotiated, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Channel::Tls(stream) => stream.get_ref().1.alpn_protocol(),
            _ => None,
        }
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        dispatch!(self.poll_read(cx, buf))
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        dispatch!(self.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        dispatch!(self.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        dispatch!(self.poll_shutdown(cx))
    }
}

/// Replays a buffered prefix before reading from the inner stream.
///
/// Proxy negotiators read replies in chunks; anything past the reply headers
/// belongs to the tunnel and must reach the next pipeline stage untouched.
#[derive(Debug)]
pub struct Rewind<IO> {
    inner: IO,
    prefix: Option<Bytes>,
}

impl<IO> Rewind<IO> {
    pub(crate) fn new(inner: IO, prefix: Bytes) -> Self {
        Self {
            inner,
            prefix: Some(prefix),
        }
    }
}

impl<IO> AsyncRead for Rewind<IO>
where
    IO: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            if !prefix.is_empty() {
                let n = std::cmp::min(prefix.len(), buf.remaining());
                buf.put_slice(&prefix[..n]);
                prefix.advance(n);

                if !prefix.is_empty() {
                    self.prefix = Some(prefix);
                }
                return Poll::Ready(Ok(()));
            }
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<IO> AsyncWrite for Rewind<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// The HTTP protocol selected for a connection.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum HttpProtocol {
    /// HTTP/1.1
    Http1,
    /// HTTP/2
    Http2,
}

impl HttpProtocol {
    /// Does this protocol allow multiplexing?
    pub fn multiplex(&self) -> bool {
        matches!(self, Self::Http2)
    }

    /// The corresponding HTTP version.
    pub fn version(&self) -> http::Version {
        match self {
            Self::Http1 => http::Version::HTTP_11,
            Self::Http2 => http::Version::HTTP_2,
        }
    }
}

/// The terminal output of the connection factory: a live channel tagged with
/// the protocol the HTTP layer should speak over it.
#[derive(Debug)]
pub enum NegotiatedProtocol {
    /// Speak HTTP/1.1 over the channel.
    Http1(Channel),
    /// Speak HTTP/2 over the channel.
    Http2(Channel),
}

impl NegotiatedProtocol {
    /// The negotiated channel.
    pub fn channel(&self) -> &Channel {
        match self {
            NegotiatedProtocol::Http1(channel) | NegotiatedProtocol::Http2(channel) => channel,
        }
    }

    /// Unwrap the negotiated channel.
    pub fn into_channel(self) -> Channel {
        match self {
            NegotiatedProtocol::Http1(channel) | NegotiatedProtocol::Http2(channel) => channel,
        }
    }

    /// The selected protocol.
    pub fn protocol(&self) -> HttpProtocol {
        match self {
            NegotiatedProtocol::Http1(_) => HttpProtocol::Http1,
            NegotiatedProtocol::Http2(_) => HttpProtocol::Http2,
        }
    }
}
