//! The authentication broker.
//!
//! The proxy terminates the client handshake, opens its own handshake with
//! the chosen backend, and shuttles the authentication packets between the
//! two verbatim. Password material is never interpreted; plugin negotiation
//! (auth switch, SHA fast auth) passes straight through.

use std::sync::Arc;

use rand::RngCore;
use tracing::debug;

use crate::protocol::{
    capabilities::*, is_err_packet, is_ok_packet, ErrPacket, HandshakeResponse, InitialHandshake,
    PacketIO, AUTH_SESSION_TOKEN,
};
use crate::security::CertInfo;

use super::conn::BackendConnection;
use super::SessionError;

/// Outcome of a completed authentication exchange
pub struct AuthOutcome {
    /// Whether the backend accepted the credentials
    pub success: bool,
    /// Effective capability set for the session
    pub capability: u32,
    /// The client's parsed handshake response
    pub response: HandshakeResponse,
}

pub struct Authenticator {
    conn_id: u64,
    server_version: String,
    salt: [u8; 20],
}

impl Authenticator {
    pub fn new(conn_id: u64, server_version: &str) -> Self {
        let mut salt = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut salt);
        // Salt bytes must not be NUL; clients parse the halves as C strings.
        for b in salt.iter_mut() {
            if *b == 0 {
                *b = 1;
            }
        }
        Self {
            conn_id,
            server_version: server_version.to_string(),
            salt,
        }
    }

    /// Broker the three-party handshake for a brand-new session.
    pub async fn handshake_first_time(
        &self,
        client: &mut PacketIO,
        backend: &mut BackendConnection,
        backend_handshake: &InitialHandshake,
        frontend_tls: &Arc<CertInfo>,
        backend_tls: &Arc<CertInfo>,
    ) -> Result<AuthOutcome, SessionError> {
        // Advertise the intersection with the backend. SSL toward the client
        // is the proxy's own decision.
        let frontend_tls_config = frontend_tls.server_tls();
        let mut advertised = DEFAULT_CAPABILITIES & backend_handshake.capability_flags;
        if frontend_tls_config.is_some() {
            advertised |= CLIENT_SSL;
        } else {
            advertised &= !CLIENT_SSL;
        }

        client
            .write_initial_handshake(
                self.conn_id as u32,
                &self.salt,
                &backend_handshake.auth_plugin_name,
                &self.server_version,
                advertised,
            )
            .await
            .map_err(SessionError::Client)?;

        // First client packet: either an SSLRequest or the full response.
        let (first, is_ssl) = client
            .read_ssl_request_or_handshake_resp()
            .await
            .map_err(SessionError::Client)?;
        let response_payload = if is_ssl {
            let config = frontend_tls_config
                .ok_or(SessionError::Protocol("client requested TLS but it is disabled"))?;
            client
                .server_tls_handshake(config)
                .await
                .map_err(SessionError::Client)?;
            client.read_packet().await.map_err(SessionError::Client)?
        } else {
            first
        };

        let response = HandshakeResponse::parse(&response_payload)
            .ok_or(SessionError::Protocol("invalid handshake response"))?;
        debug!(
            conn_id = self.conn_id,
            username = %response.username,
            database = ?response.database,
            plugin = %response.auth_plugin_name,
            "received handshake response"
        );

        // The client may have dropped capabilities we offered.
        let session_caps = response.capability_flags & advertised;

        // Mirror the flow on the backend link.
        let backend_caps =
            self.backend_capability(session_caps, backend.capability, backend_tls);
        let mut forwarded = response.clone();
        forwarded.capability_flags = backend_caps;

        let payload = forwarded.encode();
        if backend_caps & CLIENT_SSL != 0 {
            let config = backend_tls
                .client_tls()
                .ok_or(SessionError::Protocol("backend TLS required but not configured"))?;
            backend
                .io
                .write_packet(&payload[..32], true)
                .await
                .map_err(SessionError::Backend)?;
            let host = backend
                .addr
                .rsplit_once(':')
                .map(|(h, _)| h)
                .unwrap_or(backend.addr.as_str());
            backend
                .io
                .client_tls_handshake(config, host)
                .await
                .map_err(SessionError::Backend)?;
        }
        backend
            .io
            .write_packet(&payload, true)
            .await
            .map_err(SessionError::Backend)?;

        // Shuttle auth packets until either side concludes.
        let success = self.shuttle_auth(client, backend).await?;
        Ok(AuthOutcome {
            success,
            capability: session_caps,
            response,
        })
    }

    /// Resume a migrated session on a fresh backend using the session token
    /// as the credential.
    pub async fn handshake_with_token(
        &self,
        backend: &mut BackendConnection,
        session_caps: u32,
        response: &HandshakeResponse,
        database: Option<&str>,
        token: &[u8],
        backend_tls: &Arc<CertInfo>,
    ) -> Result<(), SessionError> {
        let backend_caps = self.backend_capability(
            session_caps | CLIENT_PLUGIN_AUTH | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA,
            backend.capability,
            backend_tls,
        );

        let forwarded = HandshakeResponse {
            capability_flags: backend_caps,
            max_packet_size: response.max_packet_size,
            character_set: response.character_set,
            username: response.username.clone(),
            auth_response: token.to_vec(),
            database: database.map(|d| d.to_string()),
            auth_plugin_name: AUTH_SESSION_TOKEN.to_string(),
            attrs: response.attrs.clone(),
        };

        let payload = forwarded.encode();
        if backend_caps & CLIENT_SSL != 0 {
            let config = backend_tls
                .client_tls()
                .ok_or(SessionError::Protocol("backend TLS required but not configured"))?;
            backend
                .io
                .write_packet(&payload[..32], true)
                .await
                .map_err(SessionError::Backend)?;
            let host = backend
                .addr
                .rsplit_once(':')
                .map(|(h, _)| h)
                .unwrap_or(backend.addr.as_str());
            backend
                .io
                .client_tls_handshake(config, host)
                .await
                .map_err(SessionError::Backend)?;
        }
        backend
            .io
            .write_packet(&payload, true)
            .await
            .map_err(SessionError::Backend)?;

        let reply = backend.io.read_packet().await.map_err(SessionError::Backend)?;
        if is_ok_packet(&reply) {
            return Ok(());
        }
        if is_err_packet(&reply) {
            let err = ErrPacket::parse(&reply, backend_caps)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "access denied"));
            return Err(SessionError::TokenRejected(err.error_message));
        }
        // The backend must accept the token directly; a plugin switch means
        // it does not understand session tokens.
        Err(SessionError::Protocol("backend does not accept session tokens"))
    }

    fn backend_capability(
        &self,
        session_caps: u32,
        backend_advertised: u32,
        backend_tls: &Arc<CertInfo>,
    ) -> u32 {
        let mut caps = session_caps & backend_advertised;
        let backend_ssl =
            backend_advertised & CLIENT_SSL != 0 && backend_tls.client_tls().is_some();
        if backend_ssl {
            caps |= CLIENT_SSL;
        } else {
            caps &= !CLIENT_SSL;
        }
        caps
    }

    async fn shuttle_auth(
        &self,
        client: &mut PacketIO,
        backend: &mut BackendConnection,
    ) -> Result<bool, SessionError> {
        loop {
            let pkt = backend.io.read_packet().await.map_err(SessionError::Backend)?;
            client
                .write_packet(&pkt, true)
                .await
                .map_err(SessionError::Client)?;
            if is_ok_packet(&pkt) {
                return Ok(true);
            }
            if is_err_packet(&pkt) {
                return Ok(false);
            }
            // Auth switch request, SHA command, or extra plugin data: the
            // client must answer, and the answer goes through untouched.
            let reply = client.read_packet().await.map_err(SessionError::Client)?;
            backend
                .io
                .write_packet(&reply, true)
                .await
                .map_err(SessionError::Backend)?;
        }
    }
}
