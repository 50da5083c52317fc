//! PROXY protocol v2 header parsing.
//!
//! When enabled on the client listener, a load balancer in front of the proxy
//! prefixes each connection with the true client address. Only the v2 binary
//! encoding is supported.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// v2 signature: \r\n\r\n\0\r\nQUIT\n
const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const VERSION_2: u8 = 0x20;
const CMD_LOCAL: u8 = 0x00;
const CMD_PROXY: u8 = 0x01;

const FAMILY_UNSPEC: u8 = 0x00;
const FAMILY_TCP4: u8 = 0x11;
const FAMILY_TCP6: u8 = 0x21;

#[derive(Debug, thiserror::Error)]
pub enum ProxyHeaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad proxy protocol signature")]
    BadSignature,

    #[error("unsupported proxy protocol version {0:#x}")]
    UnsupportedVersion(u8),

    #[error("unsupported address family {0:#x}")]
    UnsupportedFamily(u8),

    #[error("proxy protocol header too short for family")]
    ShortHeader,
}

/// Read and parse a PROXY v2 header from the head of the stream.
///
/// Returns the advertised source address, or `None` for LOCAL commands and
/// unspecified families (the TCP peer address applies in that case).
pub async fn read_proxy_header(
    stream: &mut TcpStream,
) -> Result<Option<SocketAddr>, ProxyHeaderError> {
    let mut fixed = [0u8; 16];
    stream.read_exact(&mut fixed).await?;

    if fixed[..12] != SIGNATURE {
        return Err(ProxyHeaderError::BadSignature);
    }

    let ver_cmd = fixed[12];
    if ver_cmd & 0xF0 != VERSION_2 {
        return Err(ProxyHeaderError::UnsupportedVersion(ver_cmd));
    }
    let cmd = ver_cmd & 0x0F;
    let family = fixed[13];
    let len = u16::from_be_bytes([fixed[14], fixed[15]]) as usize;

    let mut rest = vec![0u8; len];
    stream.read_exact(&mut rest).await?;

    if cmd == CMD_LOCAL {
        return Ok(None);
    }
    if cmd != CMD_PROXY {
        return Err(ProxyHeaderError::UnsupportedVersion(ver_cmd));
    }

    match family {
        FAMILY_UNSPEC => Ok(None),
        FAMILY_TCP4 => {
            if rest.len() < 12 {
                return Err(ProxyHeaderError::ShortHeader);
            }
            let src = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let src_port = u16::from_be_bytes([rest[8], rest[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(src), src_port)))
        }
        FAMILY_TCP6 => {
            if rest.len() < 36 {
                return Err(ProxyHeaderError::ShortHeader);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            let src = Ipv6Addr::from(octets);
            let src_port = u16::from_be_bytes([rest[32], rest[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(src), src_port)))
        }
        other => Err(ProxyHeaderError::UnsupportedFamily(other)),
    }
}

/// Build a v2 header for tests and tooling
#[cfg(test)]
pub fn encode_proxy_header(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(52);
    buf.extend_from_slice(&SIGNATURE);
    buf.push(VERSION_2 | CMD_PROXY);
    match (src, dst) {
        (SocketAddr::V4(s), SocketAddr::V4(d)) => {
            buf.push(FAMILY_TCP4);
            buf.extend_from_slice(&12u16.to_be_bytes());
            buf.extend_from_slice(&s.ip().octets());
            buf.extend_from_slice(&d.ip().octets());
            buf.extend_from_slice(&s.port().to_be_bytes());
            buf.extend_from_slice(&d.port().to_be_bytes());
        }
        (SocketAddr::V6(s), SocketAddr::V6(d)) => {
            buf.push(FAMILY_TCP6);
            buf.extend_from_slice(&36u16.to_be_bytes());
            buf.extend_from_slice(&s.ip().octets());
            buf.extend_from_slice(&d.ip().octets());
            buf.extend_from_slice(&s.port().to_be_bytes());
            buf.extend_from_slice(&d.port().to_be_bytes());
        }
        _ => unreachable!("mixed address families"),
    }
    buf
}
