//! SOCKS5 (RFC 1928) handshake and request parsing. Only the "no
//! authentication" method is offered.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION_BYTE: u8 = 5;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unsupported socks version {0}")]
    InvalidVersion(u8),
    #[error("unsupported address type {0}")]
    InvalidAtyp(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksStatus {
    Succeeded = 0,
    GeneralFailure = 1,
    CommandNotSupported = 7,
    AtypNotSupported = 8,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksAtyp {
    IPv4 = 1,
    Domainname = 3,
    IPv6 = 4,
}

impl SocksAtyp {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::IPv4),
            3 => Some(Self::Domainname),
            4 => Some(Self::IPv6),
            _ => None,
        }
    }
}

/// Commands the bridge serves; BIND and anything else is refused.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    Connect = 1,
    UdpAssociate = 3,
}

impl SocksCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Connect),
            3 => Some(Self::UdpAssociate),
            _ => None,
        }
    }
}

/// A client request. `host` is a textual IP address or a domain name, which
/// is what TCP and UDP motes carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub command: u8,
    pub host: String,
    pub port: u16,
}

impl SocksRequest {
    pub fn command(&self) -> Option<SocksCommand> {
        SocksCommand::from_u8(self.command)
    }
}

/// Greeting: version byte, then the offered methods, which are skipped.
pub async fn handshake<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let version = stream.read_u8().await?;
    if version != VERSION_BYTE {
        return Err(SocksError::InvalidVersion(version));
    }
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = [0u8; 255];
    stream.read_exact(&mut methods[..nmethods]).await?;

    stream.write_all(&[VERSION_BYTE, 0u8]).await?;
    Ok(())
}

/// Read `VER CMD RSV ATYP DST.ADDR DST.PORT`. An unknown address type is
/// answered with "address type not supported" before the error returns.
pub async fn read_request<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let command = header[1];
    let atyp = match SocksAtyp::from_u8(header[3]) {
        Some(atyp) => atyp,
        None => {
            send_reply(stream, SocksStatus::AtypNotSupported, unspecified()).await?;
            return Err(SocksError::InvalidAtyp(header[3]));
        }
    };

    let host = match atyp {
        SocksAtyp::IPv4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        SocksAtyp::IPv6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        SocksAtyp::Domainname => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
    };
    let port = stream.read_u16().await?;

    Ok(SocksRequest {
        command,
        host,
        port,
    })
}

pub fn unspecified() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
}

/// `VER REP RSV ATYP BND.ADDR BND.PORT`
pub async fn send_reply<W>(
    writer: &mut W,
    status: SocksStatus,
    bind_address: SocketAddr,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[VERSION_BYTE, status as u8, 0]);
    match bind_address {
        SocketAddr::V4(addr4) => {
            reply.push(SocksAtyp::IPv4 as u8);
            reply.extend_from_slice(&addr4.ip().octets());
        }
        SocketAddr::V6(addr6) => {
            reply.push(SocksAtyp::IPv6 as u8);
            reply.extend_from_slice(&addr6.ip().octets());
        }
    }
    reply.extend_from_slice(&bind_address.port().to_be_bytes());
    writer.write_all(&reply).await
}
