//! SOCKSv5 negotiation, RFC 1928 with RFC 1929 username/password.

use std::io;
use std::net::IpAddr;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::deadline::ConnectionDeadline;
use crate::proxy::Authorization;
use crate::target::Target;
use crate::{Channel, Error};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const COMMAND_CONNECT: u8 = 0x01;

const ADDRESS_IPV4: u8 = 0x01;
const ADDRESS_DOMAIN: u8 = 0x03;
const ADDRESS_IPV6: u8 = 0x04;

const USERNAME_PASSWORD_VERSION: u8 = 0x01;

/// Negotiate a SOCKSv5 tunnel to `target` over an open channel to the proxy.
///
/// Domain targets are sent as domain names; the proxy resolves them. Unix
/// targets are rejected at configuration time and never reach this point.
pub(crate) async fn handshake(
    channel: Channel,
    target: &Target,
    authorization: Option<&Authorization>,
    deadline: ConnectionDeadline,
) -> Result<Channel, Error> {
    match tokio::time::timeout_at(deadline.instant(), establish(channel, target, authorization))
        .await
    {
        Ok(result) => result,
        // The channel is owned by the cancelled future and closes with it.
        Err(_) => {
            trace!(%target, "socks handshake timed out");
            Err(Error::SocksHandshakeTimeout)
        }
    }
}

async fn establish(
    mut channel: Channel,
    target: &Target,
    authorization: Option<&Authorization>,
) -> Result<Channel, Error> {
    let credentials = match authorization {
        Some(Authorization::Basic { username, password }) => Some((username, password)),
        Some(Authorization::Bearer(_)) => {
            return Err(Error::InvalidProxyConfiguration(
                "SOCKS5 proxies do not support bearer tokens",
            ))
        }
        None => None,
    };

    // Greeting: offer no-auth, and username/password when we have
    // credentials.
    let methods: &[u8] = if credentials.is_some() {
        &[METHOD_NO_AUTH, METHOD_USERNAME_PASSWORD]
    } else {
        &[METHOD_NO_AUTH]
    };
    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(VERSION);
    greeting.push(methods.len() as u8);
    greeting.extend_from_slice(methods);
    channel.write_all(&greeting).await?;
    channel.flush().await?;

    let mut selection = [0u8; 2];
    read_exact(&mut channel, &mut selection).await?;
    if selection[0] != VERSION {
        return Err(Error::InvalidProxyResponse(format!(
            "socks version {} in method selection",
            selection[0]
        )));
    }

    match selection[1] {
        METHOD_NO_AUTH => {}
        METHOD_USERNAME_PASSWORD => match credentials {
            Some((username, password)) => {
                authenticate(&mut channel, username, password).await?;
            }
            None => {
                return Err(Error::ProxyAuthenticationRequired);
            }
        },
        METHOD_NO_ACCEPTABLE => {
            return Err(Error::ProxyAuthenticationRequired);
        }
        method => {
            return Err(Error::InvalidProxyResponse(format!(
                "socks proxy selected unsupported method {method:#04x}"
            )));
        }
    }

    let mut request = BytesMut::with_capacity(22);
    request.put_slice(&[VERSION, COMMAND_CONNECT, 0x00]);
    match target {
        Target::IpAddress(IpAddr::V4(ip), port) => {
            request.put_u8(ADDRESS_IPV4);
            request.put_slice(&ip.octets());
            request.put_u16(*port);
        }
        Target::IpAddress(IpAddr::V6(ip), port) => {
            request.put_u8(ADDRESS_IPV6);
            request.put_slice(&ip.octets());
            request.put_u16(*port);
        }
        Target::Domain(host, port) => {
            if host.len() > 255 {
                return Err(Error::InvalidTarget(format!(
                    "domain too long for socks: {host}"
                )));
            }
            request.put_u8(ADDRESS_DOMAIN);
            request.put_u8(host.len() as u8);
            request.put_slice(host.as_bytes());
            request.put_u16(*port);
        }
        Target::UnixSocket(_) => {
            return Err(Error::InvalidProxyConfiguration(
                "unix socket targets cannot be proxied",
            ));
        }
    }
    channel.write_all(&request).await?;
    channel.flush().await?;

    let mut reply = [0u8; 4];
    read_exact(&mut channel, &mut reply).await?;
    if reply[0] != VERSION {
        return Err(Error::InvalidProxyResponse(format!(
            "socks version {} in reply",
            reply[0]
        )));
    }
    if reply[1] != 0x00 {
        return Err(Error::InvalidProxyResponse(format!(
            "socks reply code {:#04x}",
            reply[1]
        )));
    }

    // Drain the bound address; its value is not interesting.
    let bound_len = match reply[3] {
        ADDRESS_IPV4 => 4 + 2,
        ADDRESS_IPV6 => 16 + 2,
        ADDRESS_DOMAIN => {
            let mut len = [0u8; 1];
            read_exact(&mut channel, &mut len).await?;
            len[0] as usize + 2
        }
        atyp => {
            return Err(Error::InvalidProxyResponse(format!(
                "socks reply address type {atyp:#04x}"
            )));
        }
    };
    let mut bound = vec![0u8; bound_len];
    read_exact(&mut channel, &mut bound).await?;

    trace!(%target, "socks tunnel established");
    Ok(channel)
}

/// RFC 1929 username/password sub-negotiation.
async fn authenticate(
    channel: &mut Channel,
    username: &str,
    password: &str,
) -> Result<(), Error> {
    if username.len() > 255 || password.len() > 255 {
        return Err(Error::InvalidProxyConfiguration(
            "socks credentials longer than 255 bytes",
        ));
    }

    let mut request = BytesMut::with_capacity(3 + username.len() + password.len());
    request.put_u8(USERNAME_PASSWORD_VERSION);
    request.put_u8(username.len() as u8);
    request.put_slice(username.as_bytes());
    request.put_u8(password.len() as u8);
    request.put_slice(password.as_bytes());
    channel.write_all(&request).await?;
    channel.flush().await?;

    let mut reply = [0u8; 2];
    read_exact(channel, &mut reply).await?;
    if reply[0] != USERNAME_PASSWORD_VERSION {
        return Err(Error::InvalidProxyResponse(format!(
            "socks auth version {}",
            reply[0]
        )));
    }
    if reply[1] != 0x00 {
        return Err(Error::ProxyAuthenticationRequired);
    }

    Ok(())
}

async fn read_exact(channel: &mut Channel, buf: &mut [u8]) -> Result<(), Error> {
    channel.read_exact(buf).await.map_err(|error| {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            Error::RemoteConnectionClosed
        } else {
            Error::Io(error)
        }
    })?;
    Ok(())
}
