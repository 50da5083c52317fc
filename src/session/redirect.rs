//! Session-state capture and restore for live migration.
//!
//! The database owns the blob format: `SHOW SESSION_STATES` returns one row
//! of (state, token) text columns and `SET SESSION_STATES` replays it. The
//! proxy treats both columns as opaque strings, which keeps migration
//! compatible across backend versions.

use bytes::Bytes;

use crate::protocol::{
    capabilities::CLIENT_DEPRECATE_EOF, is_eof_packet, is_err_packet, is_ok_packet,
    is_result_set_ok_packet, parse_length_encoded_int, parse_length_encoded_string, Command,
    ErrPacket,
};

use super::conn::BackendConnection;
use super::SessionError;

const SESSION_STATES_QUERY: &str = "SHOW SESSION_STATES";

/// Captured session state: the opaque blob and the short-lived auth token
#[derive(Debug, Clone)]
pub struct SessionStates {
    pub states: String,
    pub token: String,
}

/// Ask the current backend to serialize the session.
pub async fn fetch_session_states(
    backend: &mut BackendConnection,
    capability: u32,
) -> Result<SessionStates, SessionError> {
    backend.io.reset_sequence();
    let mut request = Vec::with_capacity(1 + SESSION_STATES_QUERY.len());
    request.push(Command::Query as u8);
    request.extend_from_slice(SESSION_STATES_QUERY.as_bytes());
    backend
        .io
        .write_packet(&request, true)
        .await
        .map_err(SessionError::Backend)?;

    let deprecate_eof = capability & CLIENT_DEPRECATE_EOF != 0;

    let first = backend.io.read_packet().await.map_err(SessionError::Backend)?;
    if is_err_packet(&first) {
        let err = ErrPacket::parse(&first, capability)
            .map(|e| e.error_message)
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(SessionError::SessionStates(err));
    }
    let (column_count, _) = parse_length_encoded_int(&first)
        .ok_or(SessionError::Protocol("bad session states column count"))?;
    if column_count != 2 {
        return Err(SessionError::Protocol("unexpected session states columns"));
    }

    // Column definitions, with a separator EOF in the legacy encoding.
    for _ in 0..column_count {
        backend.io.read_packet().await.map_err(SessionError::Backend)?;
    }
    if !deprecate_eof {
        backend.io.read_packet().await.map_err(SessionError::Backend)?;
    }

    // Exactly one row, then the terminator.
    let mut row: Option<Bytes> = None;
    loop {
        let pkt = backend.io.read_packet().await.map_err(SessionError::Backend)?;
        if is_err_packet(&pkt) {
            let err = ErrPacket::parse(&pkt, capability)
                .map(|e| e.error_message)
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(SessionError::SessionStates(err));
        }
        let is_end = if deprecate_eof {
            is_result_set_ok_packet(&pkt)
        } else {
            is_eof_packet(&pkt)
        };
        if is_end {
            break;
        }
        if row.is_none() {
            row = Some(pkt);
        }
    }

    let row = row.ok_or(SessionError::Protocol("empty session states result"))?;
    let (states, consumed) = parse_length_encoded_string(&row)
        .ok_or(SessionError::Protocol("bad session states row"))?;
    let (token, _) = parse_length_encoded_string(&row[consumed..])
        .ok_or(SessionError::Protocol("bad session token column"))?;
    if token.is_empty() {
        return Err(SessionError::SessionStates("empty session token".to_string()));
    }
    Ok(SessionStates {
        states: String::from_utf8_lossy(states).to_string(),
        token: String::from_utf8_lossy(token).to_string(),
    })
}

/// Replay the captured state on a freshly authenticated backend.
pub async fn restore_session_states(
    backend: &mut BackendConnection,
    capability: u32,
    states: &str,
) -> Result<(), SessionError> {
    backend.io.reset_sequence();
    let sql = format!("SET SESSION_STATES '{}'", escape_single_quoted(states));
    let mut request = Vec::with_capacity(1 + sql.len());
    request.push(Command::Query as u8);
    request.extend_from_slice(sql.as_bytes());
    backend
        .io
        .write_packet(&request, true)
        .await
        .map_err(SessionError::Backend)?;

    let reply = backend.io.read_packet().await.map_err(SessionError::Backend)?;
    if is_ok_packet(&reply) {
        return Ok(());
    }
    let err = ErrPacket::parse(&reply, capability)
        .map(|e| e.error_message)
        .unwrap_or_else(|| "unexpected restore reply".to_string());
    Err(SessionError::SessionStates(err))
}

/// Escape a value for inclusion in a single-quoted SQL literal
fn escape_single_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(ch),
        }
    }
    out
}
