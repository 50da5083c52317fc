//! Integration tests driving the proxy path with in-process mock clients and
//! mock backends. No external MySQL server is required.

mod auth;
mod packetio;
mod redirect;

pub mod testkit {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::{BufMut, BytesMut};
    use parking_lot::Mutex;
    use tokio::net::{TcpListener, TcpStream};

    use hermes::protocol::{
        build_eof_packet, capabilities::*, encode_length_encoded_string, is_err_packet,
        is_ok_packet, status::SERVER_STATUS_AUTOCOMMIT, Command, HandshakeResponse,
        InitialHandshake, OkPacket, PacketIO, AUTH_NATIVE_PASSWORD, AUTH_SESSION_TOKEN, EOF_HEADER,
        OK_HEADER,
    };

    pub const MOCK_SERVER_VERSION: &str = "8.0.11-mock";
    pub const MOCK_SESSION_STATES: &str = "{\"user\":\"app\"}";
    pub const MOCK_SESSION_TOKEN: &str = "token-0123456789abcdef";

    /// A connected (client, server) PacketIO pair over loopback TCP
    pub async fn tcp_pair() -> (PacketIO, PacketIO) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let client = connect.await.unwrap();
        (PacketIO::new(client), PacketIO::new(server))
    }

    /// What one mock backend instance observed
    #[derive(Debug, Default)]
    pub struct BackendLog {
        pub auth_plugins: Vec<String>,
        pub auth_data: Vec<Vec<u8>>,
        pub usernames: Vec<String>,
        pub queries: Vec<String>,
        pub closed_conns: usize,
    }

    /// Configuration for a mock backend instance
    #[derive(Clone)]
    pub struct MockBackendConfig {
        pub capability: u32,
        pub auth_succeed: bool,
        /// Result-set shape for plain queries: (columns, rows); None => OK
        pub result_set: Option<(usize, usize)>,
    }

    impl Default for MockBackendConfig {
        fn default() -> Self {
            Self {
                // Legacy EOF framing keeps the packet transcript explicit.
                capability: DEFAULT_CAPABILITIES & !CLIENT_DEPRECATE_EOF & !CLIENT_SSL,
                auth_succeed: true,
                result_set: None,
            }
        }
    }

    /// A MySQL-speaking backend good enough to authenticate sessions, answer
    /// queries, and serialize/restore session state.
    pub struct MockBackend {
        pub addr: String,
        pub log: Arc<Mutex<BackendLog>>,
    }

    impl MockBackend {
        pub async fn spawn(config: MockBackendConfig) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let log = Arc::new(Mutex::new(BackendLog::default()));

            let conn_log = log.clone();
            tokio::spawn(async move {
                let mut conn_id = 100u32;
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    conn_id += 1;
                    let config = config.clone();
                    let log = conn_log.clone();
                    tokio::spawn(async move {
                        let mut io = PacketIO::new(stream);
                        if serve_conn(&mut io, conn_id, &config, &log).await.is_err() {
                            log.lock().closed_conns += 1;
                        }
                        let _ = io.close().await;
                    });
                }
            });

            Self { addr, log }
        }
    }

    async fn serve_conn(
        io: &mut PacketIO,
        conn_id: u32,
        config: &MockBackendConfig,
        log: &Arc<Mutex<BackendLog>>,
    ) -> Result<(), hermes::protocol::ProtocolError> {
        let salt: Vec<u8> = (10u8..30).collect();
        io.write_initial_handshake(
            conn_id,
            &salt,
            AUTH_NATIVE_PASSWORD,
            MOCK_SERVER_VERSION,
            config.capability,
        )
        .await?;

        let (payload, _is_ssl) = io.read_ssl_request_or_handshake_resp().await?;
        let resp = HandshakeResponse::parse(&payload).expect("handshake response");
        {
            let mut log = log.lock();
            log.usernames.push(resp.username.clone());
            log.auth_plugins.push(resp.auth_plugin_name.clone());
            log.auth_data.push(resp.auth_response.clone());
        }

        if resp.auth_plugin_name != AUTH_SESSION_TOKEN {
            // Ask for the scramble against our own salt, like a real server.
            io.write_switch_request(AUTH_NATIVE_PASSWORD, &salt).await?;
            let scramble = io.read_packet().await?;
            log.lock().auth_data.push(scramble.to_vec());
        }

        if config.auth_succeed {
            io.write_ok_packet(SERVER_STATUS_AUTOCOMMIT, OK_HEADER, config.capability)
                .await?;
        } else {
            io.write_err_packet(1045, "28000", "Access denied", config.capability)
                .await?;
            return Ok(());
        }

        // Command phase.
        loop {
            io.reset_sequence();
            let request = io.read_packet().await?;
            if request.is_empty() {
                continue;
            }
            match Command::from(request[0]) {
                Command::Quit => return Ok(()),
                Command::Query => {
                    let sql = String::from_utf8_lossy(&request[1..]).to_string();
                    log.lock().queries.push(sql.clone());
                    if sql == "SHOW SESSION_STATES" {
                        respond_session_states(io, config.capability).await?;
                    } else if sql == "BEGIN" {
                        io.write_ok_packet(
                            hermes::protocol::status::SERVER_STATUS_IN_TRANS,
                            OK_HEADER,
                            config.capability,
                        )
                        .await?;
                    } else if config.result_set.is_some() && sql.starts_with("SELECT") {
                        let (columns, rows) = config.result_set.unwrap();
                        respond_result_set(io, config.capability, columns, rows).await?;
                    } else {
                        io.write_ok_packet(SERVER_STATUS_AUTOCOMMIT, OK_HEADER, config.capability)
                            .await?;
                    }
                }
                Command::StmtPrepare => {
                    log.lock()
                        .queries
                        .push(String::from_utf8_lossy(&request[1..]).to_string());
                    respond_prepare(io, config.capability, 2, 1).await?;
                }
                Command::Ping => {
                    io.write_ok_packet(SERVER_STATUS_AUTOCOMMIT, OK_HEADER, config.capability)
                        .await?;
                }
                _ => {
                    io.write_err_packet(1047, "08S01", "Unknown command", config.capability)
                        .await?;
                }
            }
        }
    }

    async fn respond_session_states(
        io: &mut PacketIO,
        capability: u32,
    ) -> Result<(), hermes::protocol::ProtocolError> {
        // Column count.
        io.write_packet(&[0x02], false).await?;
        // Two column definitions; content is opaque to the walker.
        io.write_packet(b"\x03def session_states", false).await?;
        io.write_packet(b"\x03def session_token", false).await?;
        if capability & CLIENT_DEPRECATE_EOF == 0 {
            io.write_packet(&build_eof_packet(0), false).await?;
        }
        // One row: (states, token).
        let mut row = BytesMut::new();
        encode_length_encoded_string(&mut row, MOCK_SESSION_STATES.as_bytes());
        encode_length_encoded_string(&mut row, MOCK_SESSION_TOKEN.as_bytes());
        io.write_packet(&row, false).await?;
        write_result_end(io, capability, 0).await?;
        io.flush().await
    }

    async fn respond_result_set(
        io: &mut PacketIO,
        capability: u32,
        columns: usize,
        rows: usize,
    ) -> Result<(), hermes::protocol::ProtocolError> {
        io.write_packet(&[columns as u8], false).await?;
        for i in 0..columns {
            let def = format!("\x03def col{i}");
            io.write_packet(def.as_bytes(), false).await?;
        }
        if capability & CLIENT_DEPRECATE_EOF == 0 {
            io.write_packet(&build_eof_packet(0), false).await?;
        }
        for i in 0..rows {
            let mut row = BytesMut::new();
            for j in 0..columns {
                encode_length_encoded_string(&mut row, format!("v{i}_{j}").as_bytes());
            }
            io.write_packet(&row, false).await?;
        }
        write_result_end(io, capability, 0).await?;
        io.flush().await
    }

    async fn respond_prepare(
        io: &mut PacketIO,
        capability: u32,
        num_columns: u16,
        num_params: u16,
    ) -> Result<(), hermes::protocol::ProtocolError> {
        let mut head = BytesMut::new();
        head.put_u8(0x00); // prepare OK
        head.put_u32_le(7); // statement id
        head.put_u16_le(num_columns);
        head.put_u16_le(num_params);
        head.put_u8(0x00);
        head.put_u16_le(0); // warnings
        io.write_packet(&head, false).await?;

        for i in 0..num_params {
            let def = format!("\x03def param{i}");
            io.write_packet(def.as_bytes(), false).await?;
        }
        if num_params > 0 && capability & CLIENT_DEPRECATE_EOF == 0 {
            io.write_packet(&build_eof_packet(0), false).await?;
        }
        for i in 0..num_columns {
            let def = format!("\x03def col{i}");
            io.write_packet(def.as_bytes(), false).await?;
        }
        if num_columns > 0 && capability & CLIENT_DEPRECATE_EOF == 0 {
            io.write_packet(&build_eof_packet(0), false).await?;
        }
        io.flush().await
    }

    async fn write_result_end(
        io: &mut PacketIO,
        capability: u32,
        server_status: u16,
    ) -> Result<(), hermes::protocol::ProtocolError> {
        if capability & CLIENT_DEPRECATE_EOF != 0 {
            let pkt = OkPacket::new(server_status, EOF_HEADER).encode(capability);
            io.write_packet(&pkt, false).await
        } else {
            io.write_packet(&build_eof_packet(server_status), false).await
        }
    }

    /// Minimal MySQL client: handshake, then commands over the proxy link
    pub struct MockClient {
        pub io: PacketIO,
        pub capability: u32,
        pub server_version: String,
    }

    impl MockClient {
        pub async fn connect(proxy_addr: &str) -> Self {
            let stream = TcpStream::connect(proxy_addr).await.unwrap();
            Self {
                io: PacketIO::new(stream),
                capability: 0,
                server_version: String::new(),
            }
        }

        /// Run the client half of the handshake; returns true on OK
        pub async fn authenticate(&mut self, username: &str, database: Option<&str>) -> bool {
            let payload = self.io.read_packet().await.unwrap();
            let server_hs = InitialHandshake::parse(&payload).expect("server handshake");
            self.server_version = server_hs.server_version.clone();
            self.capability =
                server_hs.capability_flags & (DEFAULT_CAPABILITIES & !CLIENT_SSL);

            let resp = HandshakeResponse {
                capability_flags: self.capability,
                max_packet_size: 1 << 24,
                character_set: 0x21,
                username: username.to_string(),
                auth_response: vec![0xA5; 20],
                database: database.map(|d| d.to_string()),
                auth_plugin_name: server_hs.auth_plugin_name.clone(),
                attrs: Default::default(),
            };
            self.io.write_packet(&resp.encode(), true).await.unwrap();

            loop {
                let pkt = self.io.read_packet().await.unwrap();
                if is_ok_packet(&pkt) {
                    return true;
                }
                if is_err_packet(&pkt) {
                    return false;
                }
                // Auth switch or SHA command: answer with scramble bytes.
                self.io.write_packet(&[0x5A; 20], true).await.unwrap();
            }
        }

        /// Send COM_QUERY and collect the response packets
        pub async fn query(&mut self, sql: &str) -> Vec<bytes::Bytes> {
            self.io.reset_sequence();
            let mut request = vec![Command::Query as u8];
            request.extend_from_slice(sql.as_bytes());
            self.io.write_packet(&request, true).await.unwrap();
            self.read_response().await
        }

        /// Read packets until the response terminates
        pub async fn read_response(&mut self) -> Vec<bytes::Bytes> {
            let mut packets = Vec::new();
            let first = self.io.read_packet().await.unwrap();
            let header = first.first().copied().unwrap_or(0xFF);
            packets.push(first);
            if header == 0x00 || header == 0xFF {
                return packets;
            }
            // Result set: columns, EOF, rows, EOF (legacy framing).
            let mut eof_seen = 0;
            loop {
                let pkt = self.io.read_packet().await.unwrap();
                let is_eof = pkt.first() == Some(&0xFE) && pkt.len() <= 5;
                let is_err = pkt.first() == Some(&0xFF);
                packets.push(pkt);
                if is_err {
                    return packets;
                }
                if is_eof {
                    eof_seen += 1;
                    if eof_seen == 2 {
                        return packets;
                    }
                }
            }
        }

        pub async fn quit(mut self) {
            self.io.reset_sequence();
            let _ = self.io.write_packet(&[Command::Quit as u8], true).await;
            let _ = self.io.close().await;
        }
    }

    /// Poll until the condition holds or the deadline passes
    pub async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached: {what}");
    }

    use std::sync::atomic::{AtomicU64, Ordering};

    use hermes::config::{BalanceConfig, HealthCheckConfig, ProxyConfig, TlsConfig};
    use hermes::router::Router;
    use hermes::security::CertInfo;
    use hermes::session::ClientSession;
    use tokio_util::sync::CancellationToken;

    static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

    /// A proxy instance accepting on an ephemeral port, routing to the given
    /// backends.
    pub struct ProxyHarness {
        pub addr: String,
        pub router: Arc<Router>,
        pub shutdown: CancellationToken,
    }

    pub async fn start_proxy(backends: &[String]) -> ProxyHarness {
        let mut health = HealthCheckConfig::default();
        health.enabled = false;
        let router = Router::new(BalanceConfig::default(), health);
        router.update_backends(backends);

        let frontend_tls = Arc::new(CertInfo::new_server(TlsConfig::default()));
        frontend_tls.reload().unwrap();
        let backend_tls = Arc::new(CertInfo::new_client(TlsConfig::default()));
        backend_tls.reload().unwrap();
        let proxy_cfg = Arc::new(ProxyConfig::default());
        let shutdown = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        {
            let router = router.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, peer)) = listener.accept().await else {
                        break;
                    };
                    let session = ClientSession::new(
                        SESSION_IDS.fetch_add(1, Ordering::SeqCst),
                        router.clone(),
                        frontend_tls.clone(),
                        backend_tls.clone(),
                        proxy_cfg.clone(),
                        shutdown.clone(),
                    );
                    tokio::spawn(async move {
                        let _ = session.run(stream, peer).await;
                    });
                }
            });
        }

        ProxyHarness {
            addr,
            router,
            shutdown,
        }
    }
}
