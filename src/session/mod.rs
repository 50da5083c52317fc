mod auth;
mod conn;
mod forward;
mod redirect;

pub use auth::{AuthOutcome, Authenticator};
pub use conn::BackendConnection;
pub use forward::{forward_command, CommandOutcome};
pub use redirect::{fetch_session_states, restore_session_states, SessionStates};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::metrics::metrics;
use crate::protocol::{status::*, Command, HandshakeResponse, PacketIO, ProtocolError};
use crate::router::{ConnHandle, Router, RouterError};
use crate::security::CertInfo;

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("client IO: {0}")]
    Client(#[source] ProtocolError),

    #[error("backend IO: {0}")]
    Backend(#[source] ProtocolError),

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("backend connection failed: {0}")]
    BackendConnect(String),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("session token rejected: {0}")]
    TokenRejected(String),

    #[error("session states unavailable: {0}")]
    SessionStates(String),
}

/// Mutable per-session state observed by the command loop
pub struct SessionState {
    /// Effective capability set, identical on both links apart from SSL
    pub capability: u32,
    /// Current schema; follows COM_INIT_DB
    pub database: Option<String>,
    /// The client's original handshake response, reused for token handshakes
    pub response: HandshakeResponse,
    pub in_transaction: bool,
    pub cursor_open: bool,
}

impl SessionState {
    fn new(outcome: &AuthOutcome) -> Self {
        Self {
            capability: outcome.capability,
            database: outcome.response.database.clone(),
            response: outcome.response.clone(),
            in_transaction: false,
            cursor_open: false,
        }
    }

    /// Redirection is only legal here
    pub fn safe_boundary(&self) -> bool {
        !self.in_transaction && !self.cursor_open
    }

    /// Track transaction and cursor state from a command's final status flags
    pub fn observe_status(&mut self, status: u16) {
        self.in_transaction = status & SERVER_STATUS_IN_TRANS != 0;
        if status & SERVER_STATUS_CURSOR_EXISTS != 0 {
            self.cursor_open = true;
        }
        if status & SERVER_STATUS_LAST_ROW_SEND != 0 {
            self.cursor_open = false;
        }
    }
}

enum Event {
    Shutdown,
    Redirect(String),
    RedirectChannelClosed,
    Request(Result<Bytes, ProtocolError>),
}

/// One client-facing connection: auth broker, command forwarder, redirector.
pub struct ClientSession {
    id: u64,
    router: Arc<Router>,
    frontend_tls: Arc<CertInfo>,
    backend_tls: Arc<CertInfo>,
    proxy_cfg: Arc<ProxyConfig>,
    shutdown: CancellationToken,
}

impl ClientSession {
    pub fn new(
        id: u64,
        router: Arc<Router>,
        frontend_tls: Arc<CertInfo>,
        backend_tls: Arc<CertInfo>,
        proxy_cfg: Arc<ProxyConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            router,
            frontend_tls,
            backend_tls,
            proxy_cfg,
            shutdown,
        }
    }

    pub async fn run(
        self,
        stream: TcpStream,
        client_addr: SocketAddr,
    ) -> Result<(), SessionError> {
        let mut client = PacketIO::new(stream);
        client.set_remote_addr(client_addr);
        let _ = client.set_keepalive(&self.proxy_cfg.frontend_keepalive);

        // Pick a backend, walking candidates best-first.
        let mut selector = self.router.get_backend_selector();
        let (mut backend, backend_handshake) = loop {
            let Some(addr) = selector.next() else {
                let _ = client
                    .write_err_packet(1105, "HY000", "no backend available", 0)
                    .await;
                let _ = client.close().await;
                return Err(RouterError::NoInstanceToSelect.into());
            };
            match BackendConnection::connect(&addr, &self.proxy_cfg.backend_keepalive).await {
                Ok(pair) => break pair,
                Err(err) => {
                    warn!(conn_id = self.id, addr = %addr, error = %err, "backend connect failed");
                    selector.on_create_fail(&addr);
                }
            }
        };

        let authenticator = Authenticator::new(self.id, &self.proxy_cfg.server_version);
        let auth_start = Instant::now();
        let outcome = match authenticator
            .handshake_first_time(
                &mut client,
                &mut backend,
                &backend_handshake,
                &self.frontend_tls,
                &self.backend_tls,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                metrics().record_handshake("error", auth_start.elapsed().as_secs_f64());
                selector.on_create_fail(&backend.addr);
                backend.close().await;
                let _ = client.close().await;
                return Err(err);
            }
        };

        if !outcome.success {
            // The backend already told the client why.
            metrics().record_handshake("auth_fail", auth_start.elapsed().as_secs_f64());
            info!(conn_id = self.id, username = %outcome.response.username, "authentication rejected");
            selector.on_create_fail(&backend.addr);
            backend.close().await;
            let _ = client.close().await;
            return Ok(());
        }
        metrics().record_handshake("ok", auth_start.elapsed().as_secs_f64());
        info!(
            conn_id = self.id,
            username = %outcome.response.username,
            backend = %backend.addr,
            peer = %client_addr,
            "session established"
        );

        let (handle, redirect_rx) = ConnHandle::new(self.id);
        self.router.attach_conn(&backend.addr, handle.clone());

        let mut state = SessionState::new(&outcome);
        let result = self
            .command_loop(
                &mut client,
                &mut backend,
                &mut state,
                &authenticator,
                redirect_rx,
            )
            .await;

        metrics().record_bytes("client_in", client.in_bytes());
        metrics().record_bytes("client_out", client.out_bytes());
        metrics().record_bytes("backend_in", backend.io.in_bytes());
        metrics().record_bytes("backend_out", backend.io.out_bytes());

        self.router.on_conn_closed(&backend.addr, self.id);
        backend.close().await;
        let _ = client.close().await;
        result
    }

    async fn command_loop(
        &self,
        client: &mut PacketIO,
        backend: &mut BackendConnection,
        state: &mut SessionState,
        authenticator: &Authenticator,
        mut redirect_rx: mpsc::Receiver<String>,
    ) -> Result<(), SessionError> {
        let mut redirect_closed = false;
        loop {
            // Every command starts a fresh sequence on both endpoints.
            client.reset_sequence();

            let safe = state.safe_boundary();
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Event::Shutdown,
                target = redirect_rx.recv(), if safe && !redirect_closed => match target {
                    Some(target) => Event::Redirect(target),
                    None => Event::RedirectChannelClosed,
                },
                request = client.read_packet() => Event::Request(request),
            };

            let request = match event {
                Event::Shutdown => {
                    info!(conn_id = self.id, "draining session for shutdown");
                    let _ = client.graceful_close().await;
                    return Ok(());
                }
                Event::Redirect(target) => {
                    self.handle_redirect(backend, state, authenticator, &target)
                        .await;
                    continue;
                }
                Event::RedirectChannelClosed => {
                    redirect_closed = true;
                    continue;
                }
                Event::Request(Ok(request)) => request,
                Event::Request(Err(ProtocolError::PeerClosed)) => {
                    debug!(conn_id = self.id, "client disconnected");
                    return Ok(());
                }
                Event::Request(Err(err)) => return Err(SessionError::Client(err)),
            };

            if request.is_empty() {
                return Err(SessionError::Protocol("empty command packet"));
            }
            let cmd = Command::from(request[0]);
            metrics().record_command(command_name(cmd));

            backend.io.reset_sequence();
            if cmd == Command::Quit {
                let _ = backend.io.write_packet(&request, true).await;
                debug!(conn_id = self.id, "client quit");
                return Ok(());
            }

            match forward_command(client, &mut backend.io, &request, state.capability).await {
                Ok(outcome) => {
                    if !outcome.no_reply {
                        state.observe_status(outcome.status);
                    }
                    if cmd == Command::InitDb && !outcome.failed {
                        state.database =
                            Some(String::from_utf8_lossy(&request[1..]).to_string());
                    }
                }
                Err(SessionError::Backend(err)) => {
                    // The client is still waiting for a reply; answer with a
                    // synthetic ERR before giving up on the session.
                    error!(conn_id = self.id, backend = %backend.addr, error = %err, "backend failed mid-command");
                    let _ = client
                        .write_err_packet(
                            2013,
                            "HY000",
                            "Lost connection to backend during query",
                            state.capability,
                        )
                        .await;
                    return Err(SessionError::Backend(err));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Perform one requested migration; the session stays on the old backend
    /// on any failure.
    async fn handle_redirect(
        &self,
        backend: &mut BackendConnection,
        state: &mut SessionState,
        authenticator: &Authenticator,
        target: &str,
    ) {
        let from = backend.addr.clone();
        if target == from {
            self.router.on_redirect_fail(&from, target, self.id);
            return;
        }
        match self
            .try_redirect(backend, state, authenticator, target)
            .await
        {
            Ok(()) => {
                info!(conn_id = self.id, from = %from, to = %target, "session migrated");
                self.router.on_redirect_succeed(&from, target, self.id);
            }
            Err(err) => {
                warn!(conn_id = self.id, from = %from, to = %target, error = %err, "redirect failed");
                self.router.on_redirect_fail(&from, target, self.id);
            }
        }
    }

    async fn try_redirect(
        &self,
        backend: &mut BackendConnection,
        state: &mut SessionState,
        authenticator: &Authenticator,
        target: &str,
    ) -> Result<(), SessionError> {
        let captured = fetch_session_states(backend, state.capability).await?;

        let (mut fresh, _handshake) =
            BackendConnection::connect(target, &self.proxy_cfg.backend_keepalive).await?;
        authenticator
            .handshake_with_token(
                &mut fresh,
                state.capability,
                &state.response,
                state.database.as_deref(),
                captured.token.as_bytes(),
                &self.backend_tls,
            )
            .await?;
        restore_session_states(&mut fresh, state.capability, &captured.states).await?;

        // Atomic from the forwarder's point of view: it only ever sees the
        // session between commands.
        let mut old = std::mem::replace(backend, fresh);
        old.close().await;
        Ok(())
    }
}

fn command_name(cmd: Command) -> &'static str {
    match cmd {
        Command::Quit => "quit",
        Command::InitDb => "init_db",
        Command::Query => "query",
        Command::FieldList => "field_list",
        Command::Ping => "ping",
        Command::Statistics => "statistics",
        Command::ProcessInfo => "process_info",
        Command::ChangeUser => "change_user",
        Command::StmtPrepare => "stmt_prepare",
        Command::StmtExecute => "stmt_execute",
        Command::StmtFetch => "stmt_fetch",
        Command::StmtClose => "stmt_close",
        Command::StmtReset => "stmt_reset",
        Command::StmtSendLongData => "stmt_send_long_data",
        Command::SetOption => "set_option",
        Command::ResetConnection => "reset_connection",
        _ => "other",
    }
}
