//! Command forwarding with completion detection.
//!
//! The walker parses only headers and terminators; rows and column
//! definitions pass through untouched. Detecting where a command ends is
//! what lets the redirector find a safe boundary.

use bytes::Bytes;

use crate::protocol::{
    capabilities::CLIENT_DEPRECATE_EOF, eof_status, is_eof_packet, is_err_packet, is_ok_packet,
    is_result_set_ok_packet, status::*, Command, OkPacket, PacketIO, LOCAL_IN_FILE_HEADER,
};

use super::SessionError;

/// What the forwarder learned from one completed command
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandOutcome {
    /// Server status flags from the final OK/EOF of the command
    pub status: u16,
    /// The command has no backend reply
    pub no_reply: bool,
    /// The backend answered with an ERR packet
    pub failed: bool,
}

/// Forward one command to the backend and its complete response back to the
/// client. Returns when the response is fully relayed.
pub async fn forward_command(
    client: &mut PacketIO,
    backend: &mut PacketIO,
    request: &[u8],
    capability: u32,
) -> Result<CommandOutcome, SessionError> {
    backend
        .write_packet(request, true)
        .await
        .map_err(SessionError::Backend)?;

    let deprecate_eof = capability & CLIENT_DEPRECATE_EOF != 0;
    match Command::from(request[0]) {
        Command::Quit | Command::StmtClose | Command::StmtSendLongData => Ok(CommandOutcome {
            status: 0,
            no_reply: true,
            failed: false,
        }),
        Command::Query | Command::StmtExecute | Command::ProcessInfo => {
            forward_result_sets(client, backend, capability).await
        }
        Command::StmtFetch | Command::FieldList => {
            let terminator = copy_until_result_end(client, backend, deprecate_eof).await?;
            client.flush().await.map_err(SessionError::Client)?;
            Ok(CommandOutcome {
                status: terminator_status(&terminator, capability, deprecate_eof),
                no_reply: false,
                failed: is_err_packet(&terminator),
            })
        }
        Command::StmtPrepare => forward_prepare(client, backend, deprecate_eof).await,
        Command::ChangeUser => forward_change_user(client, backend, capability).await,
        _ => {
            // Single-packet replies: OK/ERR, or a plain string for Statistics.
            let pkt = backend.read_packet().await.map_err(SessionError::Backend)?;
            client
                .write_packet(&pkt, true)
                .await
                .map_err(SessionError::Client)?;
            let status = if is_ok_packet(&pkt) {
                OkPacket::parse(&pkt, capability)
                    .map(|p| p.status_flags)
                    .unwrap_or(0)
            } else {
                0
            };
            Ok(CommandOutcome {
                status,
                no_reply: false,
                failed: is_err_packet(&pkt),
            })
        }
    }
}

/// Walk result sets, honoring SERVER_MORE_RESULTS_EXISTS, cursors, and
/// LOCAL INFILE streaming.
async fn forward_result_sets(
    client: &mut PacketIO,
    backend: &mut PacketIO,
    capability: u32,
) -> Result<CommandOutcome, SessionError> {
    let deprecate_eof = capability & CLIENT_DEPRECATE_EOF != 0;
    loop {
        let first = backend.read_packet().await.map_err(SessionError::Backend)?;

        let status = if is_err_packet(&first) {
            client
                .write_packet(&first, true)
                .await
                .map_err(SessionError::Client)?;
            return Ok(CommandOutcome {
                status: 0,
                no_reply: false,
                failed: true,
            });
        } else if is_ok_packet(&first) {
            client
                .write_packet(&first, false)
                .await
                .map_err(SessionError::Client)?;
            OkPacket::parse(&first, capability)
                .map(|p| p.status_flags)
                .unwrap_or(0)
        } else if first[0] == LOCAL_IN_FILE_HEADER {
            // The client streams the file content; an empty packet ends it.
            client
                .write_packet(&first, true)
                .await
                .map_err(SessionError::Client)?;
            loop {
                let chunk = client.read_packet().await.map_err(SessionError::Client)?;
                let done = chunk.is_empty();
                backend
                    .write_packet(&chunk, done)
                    .await
                    .map_err(SessionError::Backend)?;
                if done {
                    break;
                }
            }
            let reply = backend.read_packet().await.map_err(SessionError::Backend)?;
            client
                .write_packet(&reply, false)
                .await
                .map_err(SessionError::Client)?;
            if is_err_packet(&reply) {
                client.flush().await.map_err(SessionError::Client)?;
                return Ok(CommandOutcome {
                    status: 0,
                    no_reply: false,
                    failed: true,
                });
            }
            OkPacket::parse(&reply, capability)
                .map(|p| p.status_flags)
                .unwrap_or(0)
        } else {
            // Result set; `first` is the column count.
            client
                .write_packet(&first, false)
                .await
                .map_err(SessionError::Client)?;
            if deprecate_eof {
                // Columns and rows run back to back; one terminator ends both,
                // whether or not a cursor holds the rows back.
                let term = copy_until_result_end(client, backend, true).await?;
                if is_err_packet(&term) {
                    client.flush().await.map_err(SessionError::Client)?;
                    return Ok(CommandOutcome {
                        status: 0,
                        no_reply: false,
                        failed: true,
                    });
                }
                OkPacket::parse(&term, capability)
                    .map(|p| p.status_flags)
                    .unwrap_or(0)
            } else {
                let columns_end = copy_until_result_end(client, backend, false).await?;
                if is_err_packet(&columns_end) {
                    client.flush().await.map_err(SessionError::Client)?;
                    return Ok(CommandOutcome {
                        status: 0,
                        no_reply: false,
                        failed: true,
                    });
                }
                let columns_status = eof_status(&columns_end);
                if columns_status & SERVER_STATUS_CURSOR_EXISTS != 0 {
                    // Rows stay on the server until COM_STMT_FETCH.
                    columns_status
                } else {
                    let rows_end = copy_until_result_end(client, backend, false).await?;
                    if is_err_packet(&rows_end) {
                        client.flush().await.map_err(SessionError::Client)?;
                        return Ok(CommandOutcome {
                            status: 0,
                            no_reply: false,
                            failed: true,
                        });
                    }
                    eof_status(&rows_end)
                }
            }
        };

        if status & SERVER_MORE_RESULTS_EXISTS == 0 {
            client.flush().await.map_err(SessionError::Client)?;
            return Ok(CommandOutcome {
                status,
                no_reply: false,
                failed: false,
            });
        }
    }
}

/// Relay packets from the backend until a terminator, returning it
async fn copy_until_result_end(
    client: &mut PacketIO,
    backend: &mut PacketIO,
    deprecate_eof: bool,
) -> Result<Bytes, SessionError> {
    loop {
        let pkt = backend.read_packet().await.map_err(SessionError::Backend)?;
        client
            .write_packet(&pkt, false)
            .await
            .map_err(SessionError::Client)?;
        if is_err_packet(&pkt) {
            return Ok(pkt);
        }
        if deprecate_eof {
            if is_result_set_ok_packet(&pkt) {
                return Ok(pkt);
            }
        } else if is_eof_packet(&pkt) {
            return Ok(pkt);
        }
    }
}

fn terminator_status(pkt: &[u8], capability: u32, deprecate_eof: bool) -> u16 {
    if is_err_packet(pkt) {
        0
    } else if deprecate_eof {
        OkPacket::parse(pkt, capability)
            .map(|p| p.status_flags)
            .unwrap_or(0)
    } else {
        eof_status(pkt)
    }
}

/// A prepare response carries (num_params, num_columns) definition packets,
/// each group EOF-terminated unless EOF is deprecated.
async fn forward_prepare(
    client: &mut PacketIO,
    backend: &mut PacketIO,
    deprecate_eof: bool,
) -> Result<CommandOutcome, SessionError> {
    let first = backend.read_packet().await.map_err(SessionError::Backend)?;
    client
        .write_packet(&first, false)
        .await
        .map_err(SessionError::Client)?;
    if is_err_packet(&first) {
        client.flush().await.map_err(SessionError::Client)?;
        return Ok(CommandOutcome {
            status: 0,
            no_reply: false,
            failed: true,
        });
    }
    if first.len() < 9 {
        return Err(SessionError::Protocol("short prepare response"));
    }
    let num_columns = u16::from_le_bytes([first[5], first[6]]) as usize;
    let num_params = u16::from_le_bytes([first[7], first[8]]) as usize;

    let mut expected = num_columns + num_params;
    if !deprecate_eof {
        if num_columns > 0 {
            expected += 1;
        }
        if num_params > 0 {
            expected += 1;
        }
    }
    for _ in 0..expected {
        let pkt = backend.read_packet().await.map_err(SessionError::Backend)?;
        client
            .write_packet(&pkt, false)
            .await
            .map_err(SessionError::Client)?;
    }
    client.flush().await.map_err(SessionError::Client)?;
    Ok(CommandOutcome {
        status: 0,
        no_reply: false,
        failed: false,
    })
}

/// COM_CHANGE_USER re-runs authentication; the exchange shuttles verbatim
/// until OK or ERR, exactly like the initial handshake.
async fn forward_change_user(
    client: &mut PacketIO,
    backend: &mut PacketIO,
    capability: u32,
) -> Result<CommandOutcome, SessionError> {
    loop {
        let pkt = backend.read_packet().await.map_err(SessionError::Backend)?;
        client
            .write_packet(&pkt, true)
            .await
            .map_err(SessionError::Client)?;
        if is_ok_packet(&pkt) {
            let status = OkPacket::parse(&pkt, capability)
                .map(|p| p.status_flags)
                .unwrap_or(0);
            return Ok(CommandOutcome {
                status,
                no_reply: false,
                failed: false,
            });
        }
        if is_err_packet(&pkt) {
            return Ok(CommandOutcome {
                status: 0,
                no_reply: false,
                failed: true,
            });
        }
        let reply = client.read_packet().await.map_err(SessionError::Client)?;
        backend
            .write_packet(&reply, true)
            .await
            .map_err(SessionError::Backend)?;
    }
}
