//! HTTP `CONNECT` tunnel negotiation.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::deadline::ConnectionDeadline;
use crate::proxy::Authorization;
use crate::{Channel, Error};

/// Upper bound on the proxy's reply head; anything longer is not a status
/// line and headers.
const MAX_RESPONSE_HEAD: usize = 8192;

/// Negotiate a `CONNECT` tunnel to `authority` over an open channel to the
/// proxy.
///
/// On success the returned channel carries only tunnel bytes: anything the
/// proxy sent past its reply headers is replayed ahead of the socket.
pub(crate) async fn handshake(
    channel: Channel,
    authority: &str,
    authorization: Option<&Authorization>,
    deadline: ConnectionDeadline,
) -> Result<Channel, Error> {
    match tokio::time::timeout_at(
        deadline.instant(),
        establish_tunnel(channel, authority, authorization),
    )
    .await
    {
        Ok(result) => result,
        // The channel is owned by the cancelled future and closes with it.
        Err(_) => {
            trace!(authority, "proxy handshake timed out");
            Err(Error::HttpProxyHandshakeTimeout)
        }
    }
}

async fn establish_tunnel(
    mut channel: Channel,
    authority: &str,
    authorization: Option<&Authorization>,
) -> Result<Channel, Error> {
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n").into_bytes();

    if let Some(authorization) = authorization {
        debug!(authority, "tunneling with proxy authorization");
        request.extend_from_slice(b"Proxy-Authorization: ");
        request.extend_from_slice(authorization.header_value().as_bytes());
        request.extend_from_slice(b"\r\n");
    }

    request.extend_from_slice(b"\r\n");

    channel.write_all(&request).await?;
    channel.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let n = channel.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::RemoteConnectionClosed);
        }

        if let Some(end) = response_head_end(&buf) {
            let status = parse_status_line(&buf[..end])?;
            trace!(authority, status, "proxy replied");
            return match status {
                200..=299 => {
                    let leftover = buf.split_off(end).freeze();
                    Ok(channel.rewound(leftover))
                }
                407 => Err(Error::ProxyAuthenticationRequired),
                status => Err(Error::InvalidProxyResponse(format!(
                    "proxy replied with status {status}"
                ))),
            };
        }

        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(Error::InvalidProxyResponse(
                "proxy response headers too long".into(),
            ));
        }
    }
}

/// The index one past the `\r\n\r\n` terminator, if present.
fn response_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|idx| idx + 4)
}

fn parse_status_line(head: &[u8]) -> Result<u16, Error> {
    let line_end = head
        .windows(2)
        .position(|window| window == b"\r\n")
        .unwrap_or(head.len());
    let line = &head[..line_end];

    let malformed = || {
        Error::InvalidProxyResponse(format!(
            "malformed status line {:?}",
            String::from_utf8_lossy(line)
        ))
    };

    if !(line.starts_with(b"HTTP/1.1 ") || line.starts_with(b"HTTP/1.0 ")) {
        return Err(malformed());
    }

    let status = line
        .get(9..12)
        .and_then(|digits| std::str::from_utf8(digits).ok())
        .and_then(|digits| digits.parse::<u16>().ok())
        .ok_or_else(malformed)?;

    Ok(status)
}
