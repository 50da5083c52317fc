use tokio::net::TcpStream;
use tracing::debug;

use crate::config::KeepaliveConfig;
use crate::protocol::{InitialHandshake, PacketIO};

use super::SessionError;

/// One authenticated (or authenticating) socket toward a backend
pub struct BackendConnection {
    pub io: PacketIO,
    pub addr: String,
    /// Capability set advertised by the backend
    pub capability: u32,
    pub server_version: String,
}

impl BackendConnection {
    /// Dial a backend and read its initial handshake. Authentication is
    /// driven by the caller, which decides what to put in the response.
    pub async fn connect(
        addr: &str,
        keepalive: &KeepaliveConfig,
    ) -> Result<(Self, InitialHandshake), SessionError> {
        debug!(addr = %addr, "connecting to backend");
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SessionError::BackendConnect(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| SessionError::BackendConnect(e.to_string()))?;

        let io = PacketIO::new(stream);
        let _ = io.set_keepalive(keepalive);

        let mut conn = Self {
            io,
            addr: addr.to_string(),
            capability: 0,
            server_version: String::new(),
        };

        let payload = conn
            .io
            .read_packet()
            .await
            .map_err(SessionError::Backend)?;
        let handshake = InitialHandshake::parse(&payload)
            .ok_or(SessionError::Protocol("invalid backend handshake"))?;

        debug!(
            addr = %addr,
            server_version = %handshake.server_version,
            "received backend handshake"
        );

        conn.capability = handshake.capability_flags;
        conn.server_version = handshake.server_version.clone();
        Ok((conn, handshake))
    }

    pub async fn close(&mut self) {
        let _ = self.io.close().await;
    }
}
