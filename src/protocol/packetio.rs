use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::KeepaliveConfig;

use super::handshake::{build_auth_switch_request, ErrPacket, InitialHandshake, OkPacket};
use super::packet::{capabilities, FULL_AUTH, MAX_PAYLOAD_LEN, SHA_COMMAND};

/// Minimum salt length accepted by the initial handshake emitter
const MIN_SALT_LEN: usize = 20;

/// Flush the write buffer once it grows past this size, so oversized
/// payloads don't double in memory.
const WRITE_FLUSH_THRESHOLD: usize = 16 * 1024;

/// How long a liveness probe waits before concluding the peer is merely idle
const PEER_PROBE_TIMEOUT: Duration = Duration::from_millis(50);

/// Packet transport errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("bad packet sequence: expected {expected}, got {got}")]
    BadSequence { expected: u8, got: u8 },

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("truncated packet")]
    Truncated,

    #[error("salt is not long enough")]
    SaltNotLongEnough,

    #[error("connection is already secured")]
    TlsAlreadyEnabled,

    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl ProtocolError {
    /// Whether this error came from the transport rather than the protocol
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::PeerClosed | ProtocolError::Truncated
        )
    }
}

/// The underlying byte stream, upgradable to TLS in either role
enum Transport {
    Plain(TcpStream),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// Placeholder while a TLS upgrade is in flight
    Detached,
}

impl Transport {
    fn tcp(&self) -> Option<&TcpStream> {
        match self {
            Transport::Plain(s) => Some(s),
            Transport::ClientTls(s) => Some(s.get_ref().0),
            Transport::ServerTls(s) => Some(s.get_ref().0),
            Transport::Detached => None,
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::Detached => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport detached",
            ))),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::Detached => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport detached",
            ))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::Detached => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::Detached => Poll::Ready(Ok(())),
        }
    }
}

/// Framed duplex transport for the MySQL wire protocol.
///
/// Splits logical packets into 16MB-1 chunks on write and reassembles them on
/// read, carrying one sequence counter across reads and writes the way the
/// protocol alternates within an exchange. The write side is buffered;
/// callers flush explicitly at protocol boundaries.
pub struct PacketIO {
    transport: Transport,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// MySQL sequence counter, shared by reads and writes within one exchange
    sequence: u8,
    in_bytes: u64,
    out_bytes: u64,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    closed: bool,
}

impl PacketIO {
    pub fn new(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        Self {
            transport: Transport::Plain(stream),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            sequence: 0,
            in_bytes: 0,
            out_bytes: 0,
            local_addr,
            remote_addr,
            closed: false,
        }
    }

    /// Reset the sequence counter. Called at command boundaries and after
    /// an auth switch.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Cumulative bytes read from the wire, including chunk headers
    pub fn in_bytes(&self) -> u64 {
        self.in_bytes
    }

    /// Cumulative bytes written to the wire, including chunk headers
    pub fn out_bytes(&self) -> u64 {
        self.out_bytes
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Override the peer address with one learned from a proxy-protocol header
    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    async fn fill_to(&mut self, n: usize) -> Result<(), ProtocolError> {
        while self.read_buf.len() < n {
            let read = self.transport.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Err(ProtocolError::PeerClosed);
                }
                return Err(ProtocolError::Truncated);
            }
        }
        Ok(())
    }

    /// Read one logical packet, reassembling continuation chunks.
    ///
    /// Cancel safe: nothing is consumed (and the sequence does not advance)
    /// until an entire chunk is buffered.
    pub async fn read_packet(&mut self) -> Result<Bytes, ProtocolError> {
        let mut payload = BytesMut::new();
        loop {
            self.fill_to(4).await?;
            let len = (self.read_buf[0] as usize)
                | ((self.read_buf[1] as usize) << 8)
                | ((self.read_buf[2] as usize) << 16);
            self.fill_to(4 + len).await?;

            let seq = self.read_buf[3];
            if seq != self.sequence {
                return Err(ProtocolError::BadSequence {
                    expected: self.sequence,
                    got: seq,
                });
            }
            self.sequence = self.sequence.wrapping_add(1);
            self.read_buf.advance(4);
            payload.extend_from_slice(&self.read_buf[..len]);
            self.read_buf.advance(len);
            self.in_bytes += (len + 4) as u64;

            if len < MAX_PAYLOAD_LEN {
                break;
            }
        }
        Ok(payload.freeze())
    }

    /// Write one logical packet, splitting it into chunks. An exact multiple
    /// of the chunk size is terminated with an empty chunk per the MySQL
    /// convention.
    pub async fn write_packet(&mut self, payload: &[u8], flush: bool) -> Result<(), ProtocolError> {
        let mut remaining = payload;
        loop {
            let chunk_len = remaining.len().min(MAX_PAYLOAD_LEN);
            let (chunk, rest) = remaining.split_at(chunk_len);

            self.write_buf.put_u8((chunk_len & 0xFF) as u8);
            self.write_buf.put_u8(((chunk_len >> 8) & 0xFF) as u8);
            self.write_buf.put_u8(((chunk_len >> 16) & 0xFF) as u8);
            self.write_buf.put_u8(self.sequence);
            self.sequence = self.sequence.wrapping_add(1);
            self.write_buf.extend_from_slice(chunk);
            self.out_bytes += (chunk_len + 4) as u64;

            if self.write_buf.len() >= WRITE_FLUSH_THRESHOLD {
                self.write_out().await?;
            }

            remaining = rest;
            if chunk_len < MAX_PAYLOAD_LEN {
                break;
            }
        }
        if flush {
            self.flush().await?;
        }
        Ok(())
    }

    async fn write_out(&mut self) -> Result<(), ProtocolError> {
        if !self.write_buf.is_empty() {
            let buf = self.write_buf.split();
            self.transport.write_all(&buf).await?;
        }
        Ok(())
    }

    /// Flush all buffered bytes to the wire
    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        self.write_out().await?;
        self.transport.flush().await?;
        Ok(())
    }

    /// Read the client's first post-handshake packet and report whether it is
    /// an SSLRequest (32-byte payload with CLIENT_SSL set). The full
    /// HandshakeResponse is read by the caller after the TLS upgrade.
    pub async fn read_ssl_request_or_handshake_resp(
        &mut self,
    ) -> Result<(Bytes, bool), ProtocolError> {
        let pkt = self.read_packet().await?;
        if pkt.len() < 4 {
            return Err(ProtocolError::Malformed("handshake response too short"));
        }
        let caps = u32::from_le_bytes([pkt[0], pkt[1], pkt[2], pkt[3]]);
        let is_ssl = caps & capabilities::CLIENT_SSL != 0 && pkt.len() == 32;
        Ok((pkt, is_ssl))
    }

    /// Upgrade the stream in the server role. The sequence counters are NOT
    /// reset; the caller continues the handshake sequence over TLS.
    pub async fn server_tls_handshake(
        &mut self,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<(), ProtocolError> {
        self.flush().await?;
        if !self.read_buf.is_empty() {
            return Err(ProtocolError::Malformed("unread data before TLS upgrade"));
        }
        let transport = std::mem::replace(&mut self.transport, Transport::Detached);
        let tcp = match transport {
            Transport::Plain(s) => s,
            other => {
                self.transport = other;
                return Err(ProtocolError::TlsAlreadyEnabled);
            }
        };
        let acceptor = TlsAcceptor::from(config);
        let tls = acceptor.accept(tcp).await?;
        self.transport = Transport::ServerTls(Box::new(tls));
        Ok(())
    }

    /// Upgrade the stream in the client role
    pub async fn client_tls_handshake(
        &mut self,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<(), ProtocolError> {
        self.flush().await?;
        if !self.read_buf.is_empty() {
            return Err(ProtocolError::Malformed("unread data before TLS upgrade"));
        }
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ProtocolError::Malformed("invalid TLS server name"))?;
        let transport = std::mem::replace(&mut self.transport, Transport::Detached);
        let tcp = match transport {
            Transport::Plain(s) => s,
            other => {
                self.transport = other;
                return Err(ProtocolError::TlsAlreadyEnabled);
            }
        };
        let connector = TlsConnector::from(config);
        let tls = connector.connect(name, tcp).await?;
        self.transport = Transport::ClientTls(Box::new(tls));
        Ok(())
    }

    /// Non-destructive liveness probe. A quiet-but-open connection reports
    /// active; only a hard EOF/reset reports dead.
    pub async fn is_peer_active(&self) -> bool {
        if self.closed {
            return false;
        }
        let Some(tcp) = self.transport.tcp() else {
            return false;
        };
        let mut probe = [0u8; 1];
        match tokio::time::timeout(PEER_PROBE_TIMEOUT, tcp.peek(&mut probe)).await {
            Ok(Ok(0)) => false,
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
            Err(_) => true,
        }
    }

    /// Apply TCP keepalive parameters to the underlying socket
    pub fn set_keepalive(&self, cfg: &KeepaliveConfig) -> io::Result<()> {
        let Some(tcp) = self.transport.tcp() else {
            return Ok(());
        };
        let sock = socket2::SockRef::from(tcp);
        if !cfg.enabled {
            return sock.set_keepalive(false);
        }
        let mut ka = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(cfg.idle_secs))
            .with_interval(Duration::from_secs(cfg.interval_secs));
        #[cfg(unix)]
        {
            ka = ka.with_retries(cfg.count);
        }
        sock.set_tcp_keepalive(&ka)
    }

    /// Close both directions. Idempotent.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.flush().await;
        let _ = self.transport.shutdown().await;
        Ok(())
    }

    /// Half-close the write side, letting in-flight reads finish
    pub async fn graceful_close(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Ok(());
        }
        let _ = self.flush().await;
        let _ = self.transport.shutdown().await;
        Ok(())
    }

    // ---- protocol packet emitters ----

    /// Emit the proxy's initial handshake. Fails without writing anything if
    /// the salt is shorter than the protocol requires.
    pub async fn write_initial_handshake(
        &mut self,
        connection_id: u32,
        salt: &[u8],
        auth_plugin: &str,
        server_version: &str,
        capability: u32,
    ) -> Result<(), ProtocolError> {
        if salt.len() < MIN_SALT_LEN {
            return Err(ProtocolError::SaltNotLongEnough);
        }
        let hs = InitialHandshake::new(connection_id, salt, auth_plugin, server_version, capability);
        self.write_packet(&hs.encode(), true).await
    }

    pub async fn write_switch_request(
        &mut self,
        auth_plugin: &str,
        salt: &[u8],
    ) -> Result<(), ProtocolError> {
        let pkt = build_auth_switch_request(auth_plugin, salt);
        self.write_packet(&pkt, true).await
    }

    pub async fn write_ok_packet(
        &mut self,
        status: u16,
        header: u8,
        capability: u32,
    ) -> Result<(), ProtocolError> {
        let pkt = OkPacket::new(status, header).encode(capability);
        self.write_packet(&pkt, true).await
    }

    pub async fn write_err_packet(
        &mut self,
        code: u16,
        sql_state: &str,
        message: &str,
        capability: u32,
    ) -> Result<(), ProtocolError> {
        let pkt = ErrPacket::new(code, sql_state, message).encode(capability);
        self.write_packet(&pkt, true).await
    }

    pub async fn write_eof_packet(&mut self, status: u16) -> Result<(), ProtocolError> {
        let pkt = super::handshake::build_eof_packet(status);
        self.write_packet(&pkt, true).await
    }

    /// Emit the caching_sha2_password "perform full authentication" command
    pub async fn write_sha_command(&mut self) -> Result<(), ProtocolError> {
        self.write_packet(&[SHA_COMMAND, FULL_AUTH], true).await
    }
}
