//! SOCKS5 front-end (RFC 1928 subset).
//!
//! Only the "no authentication" method and the CONNECT command are
//! supported. IPv4, domain-name and IPv6 destinations are accepted.

use crate::config::Protocol;
use crate::frontend::{FrontendContext, ProtocolError, SessionError};
use crate::proxy::{Connection, DialError, Dialer, TargetAddr, Teardown};
use crate::session::SessionGuard;
use bytes::{BufMut, BytesMut};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

const VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes.
mod reply {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// Serve one SOCKS5 client: handshake, dial, reply, relay.
pub(crate) async fn serve<S, D>(
    mut client: S,
    ctx: &FrontendContext<D>,
    session: SessionGuard,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    D: Dialer,
{
    let target = handshake(&mut client).await?;
    session.set_destination(&target);

    debug!(session = %session.id(), target = %target, "SOCKS5 CONNECT");

    let destination = match ctx.dialer.dial(&target).await {
        Ok(conn) => conn,
        Err(e) => {
            ctx.metrics.dial_failed(Protocol::Socks5);
            let _ = client.write_all(&encode_reply(reply_code(&e), None)).await;
            return Err(e.into());
        }
    };

    let bound = destination.local_addr().ok();
    client
        .write_all(&encode_reply(reply::SUCCEEDED, bound))
        .await?;

    let summary = ctx.relay.run(client, destination).await;
    ctx.metrics.record_relay(
        Protocol::Socks5,
        summary.bytes_to_destination,
        summary.bytes_to_client,
    );

    info!(
        session = %session.id(),
        target = %target,
        bytes_to_destination = summary.bytes_to_destination,
        bytes_to_client = summary.bytes_to_client,
        duration_ms = session.elapsed().as_millis(),
        "SOCKS5 session completed"
    );

    match summary.teardown {
        Teardown::Failed(e) => Err(e.into()),
        Teardown::ClientClosed | Teardown::DestinationClosed => Ok(()),
    }
}

/// Run method negotiation and read the CONNECT request.
///
/// Writes the rejection replies the protocol defines (no acceptable
/// method, command not supported, address type not supported). Any other
/// malformed input closes without a reply.
async fn handshake<S>(stream: &mut S) -> Result<TargetAddr, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(stream).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.map_err(read_failed)?;
    if head[0] != VERSION {
        return Err(ProtocolError::BadVersion(head[0]).into());
    }
    let command = head[1];

    let ip = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await.map_err(read_failed)?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await.map_err(read_failed)?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        ATYP_DOMAIN => None,
        other => {
            let _ = stream
                .write_all(&encode_reply(reply::ADDRESS_TYPE_NOT_SUPPORTED, None))
                .await;
            return Err(ProtocolError::UnsupportedAddressType(other).into());
        }
    };

    let domain = match ip {
        Some(_) => None,
        None => Some(read_domain(stream).await?),
    };
    let port = stream.read_u16().await.map_err(read_failed)?;

    if command != CMD_CONNECT {
        let _ = stream
            .write_all(&encode_reply(reply::COMMAND_NOT_SUPPORTED, None))
            .await;
        return Err(ProtocolError::UnsupportedCommand(command).into());
    }

    Ok(match (ip, domain) {
        (Some(ip), _) => TargetAddr::Ip(SocketAddr::new(ip, port)),
        (None, Some(domain)) => TargetAddr::from_host_port(&domain, port),
        (None, None) => return Err(ProtocolError::InvalidDomain.into()),
    })
}

async fn negotiate<S>(stream: &mut S) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.map_err(read_failed)?;
    if head[0] != VERSION {
        return Err(ProtocolError::BadVersion(head[0]).into());
    }
    if head[1] == 0 {
        return Err(ProtocolError::NoMethods.into());
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await.map_err(read_failed)?;

    if !methods.contains(&AUTH_NONE) {
        let _ = stream.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await;
        return Err(ProtocolError::NoAcceptableMethod.into());
    }

    stream.write_all(&[VERSION, AUTH_NONE]).await?;
    Ok(())
}

async fn read_domain<S>(stream: &mut S) -> Result<String, SessionError>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await.map_err(read_failed)?;
    if len == 0 {
        return Err(ProtocolError::InvalidDomain.into());
    }

    let mut raw = vec![0u8; len as usize];
    stream.read_exact(&mut raw).await.map_err(read_failed)?;
    String::from_utf8(raw).map_err(|_| ProtocolError::InvalidDomain.into())
}

fn read_failed(e: io::Error) -> SessionError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated.into()
    } else {
        e.into()
    }
}

/// Reply code for a failed dial.
fn reply_code(err: &DialError) -> u8 {
    match err {
        DialError::Resolve { .. } | DialError::Timeout(_) => reply::HOST_UNREACHABLE,
        DialError::Connect { source, .. } => match source.kind() {
            io::ErrorKind::ConnectionRefused => reply::CONNECTION_REFUSED,
            io::ErrorKind::NetworkUnreachable => reply::NETWORK_UNREACHABLE,
            io::ErrorKind::HostUnreachable => reply::HOST_UNREACHABLE,
            io::ErrorKind::TimedOut => reply::HOST_UNREACHABLE,
            _ => reply::GENERAL_FAILURE,
        },
    }
}

/// Encode a reply frame. Failures carry an all-zero IPv4 bound address.
fn encode_reply(code: u8, bound: Option<SocketAddr>) -> BytesMut {
    let bound = bound.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(VERSION);
    buf.put_u8(code);
    buf.put_u8(0x00);
    match bound.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(bound.port());
    buf
}
