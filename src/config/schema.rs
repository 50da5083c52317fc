use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub health: HealthCheckConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listen address for client connections
    #[serde(default = "default_proxy_addr")]
    pub addr: String,
    /// Expect a PROXY protocol v2 header on every accepted connection
    #[serde(default)]
    pub proxy_protocol: bool,
    /// Version string advertised in the initial handshake
    #[serde(default = "default_server_version")]
    pub server_version: String,
    /// How long graceful shutdown waits for sessions to drain
    #[serde(default = "default_graceful_wait_secs")]
    pub graceful_wait_secs: u64,
    #[serde(default = "KeepaliveConfig::frontend")]
    pub frontend_keepalive: KeepaliveConfig,
    #[serde(default = "KeepaliveConfig::backend")]
    pub backend_keepalive: KeepaliveConfig,
}

fn default_proxy_addr() -> String {
    "0.0.0.0:6000".to_string()
}

fn default_server_version() -> String {
    "8.0.11-hermes".to_string()
}

fn default_graceful_wait_secs() -> u64 {
    30
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: default_proxy_addr(),
            proxy_protocol: false,
            server_version: default_server_version(),
            graceful_wait_secs: default_graceful_wait_secs(),
            frontend_keepalive: KeepaliveConfig::frontend(),
            backend_keepalive: KeepaliveConfig::backend(),
        }
    }
}

/// Per-socket TCP keepalive parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_keepalive_idle")]
    pub idle_secs: u64,
    #[serde(default = "default_keepalive_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_keepalive_count")]
    pub count: u32,
}

fn default_keepalive_idle() -> u64 {
    60
}

fn default_keepalive_interval() -> u64 {
    10
}

fn default_keepalive_count() -> u32 {
    5
}

impl KeepaliveConfig {
    /// Defaults for the client-facing socket
    pub fn frontend() -> Self {
        Self {
            enabled: true,
            idle_secs: 120,
            interval_secs: 30,
            count: 5,
        }
    }

    /// Defaults for backend sockets
    pub fn backend() -> Self {
        Self {
            enabled: true,
            idle_secs: 60,
            interval_secs: 10,
            count: 5,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self::frontend()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address for the admin/metrics endpoint
    #[serde(default = "default_api_addr")]
    pub addr: String,
    /// Optional HTTP basic auth credentials
    #[serde(default)]
    pub basic_auth_user: Option<String>,
    #[serde(default)]
    pub basic_auth_password: Option<String>,
    /// Global request rate limit
    #[serde(default = "default_api_rate_limit")]
    pub rate_limit_per_sec: u32,
}

fn default_api_addr() -> String {
    "0.0.0.0:3080".to_string()
}

fn default_api_rate_limit() -> u32 {
    100
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: default_api_addr(),
            basic_auth_user: None,
            basic_auth_password: None,
            rate_limit_per_sec: default_api_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// TLS between clients and the proxy (server role)
    #[serde(default)]
    pub frontend: TlsConfig,
    /// TLS between the proxy and backends (client role)
    #[serde(default)]
    pub backend: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    /// Enable TLS without verifying the peer certificate
    #[serde(default)]
    pub skip_ca: bool,
    /// Generate a self-signed certificate instead of loading one from disk
    #[serde(default)]
    pub auto_certs: bool,
    /// Validity of generated certificates
    #[serde(default = "default_auto_cert_expire_secs")]
    pub auto_cert_expire_secs: u64,
    /// Minimum TLS version, "1.2" or "1.3"
    #[serde(default = "default_min_tls_version")]
    pub min_tls_version: String,
}

fn default_auto_cert_expire_secs() -> u64 {
    // 90 days
    90 * 24 * 3600
}

fn default_min_tls_version() -> String {
    "1.2".to_string()
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca: None,
            cert: None,
            key: None,
            skip_ca: false,
            auto_certs: false,
            auto_cert_expire_secs: default_auto_cert_expire_secs(),
            min_tls_version: default_min_tls_version(),
        }
    }
}

impl TlsConfig {
    pub fn has_cert(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }

    pub fn has_ca(&self) -> bool {
        self.ca.is_some()
    }

    /// Whether any TLS at all is configured for this direction
    pub fn enabled(&self) -> bool {
        self.has_cert() || self.has_ca() || self.skip_ca || self.auto_certs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Coordination store endpoints; empty means static mode
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Fixed backend addresses used when no coordination store is configured
    #[serde(default)]
    pub static_backends: Vec<String>,
    /// How often the backend list is fetched from the store
    #[serde(default = "default_fetch_interval_ms")]
    pub fetch_interval_ms: u64,
    /// Lease TTL for the proxy's own liveness key
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,
    /// How often the proxy's own TTL key is refreshed
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    #[serde(default = "default_put_timeout_ms")]
    pub put_timeout_ms: u64,
    #[serde(default = "default_put_retry_cnt")]
    pub put_retry_cnt: u32,
    #[serde(default = "default_put_retry_interval_ms")]
    pub put_retry_interval_ms: u64,
}

fn default_fetch_interval_ms() -> u64 {
    3000
}

fn default_session_ttl_secs() -> i64 {
    45
}

fn default_refresh_interval_ms() -> u64 {
    2000
}

fn default_put_timeout_ms() -> u64 {
    100
}

fn default_put_retry_cnt() -> u32 {
    3
}

fn default_put_retry_interval_ms() -> u64 {
    10
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            static_backends: Vec::new(),
            fetch_interval_ms: default_fetch_interval_ms(),
            session_ttl_secs: default_session_ttl_secs(),
            refresh_interval_ms: default_refresh_interval_ms(),
            put_timeout_ms: default_put_timeout_ms(),
            put_retry_cnt: default_put_retry_cnt(),
            put_retry_interval_ms: default_put_retry_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Rebalance tick interval
    #[serde(default = "default_rebalance_interval_ms")]
    pub rebalance_interval_ms: u64,
    /// Maximum connections migrated per tick
    #[serde(default = "default_conns_per_loop")]
    pub conns_per_loop: usize,
    /// Rebalance only when max_score / min_score exceeds this
    #[serde(default = "default_max_score_ratio")]
    pub max_score_ratio: f64,
    /// Minimum interval between redirect attempts on one session after a failure
    #[serde(default = "default_redirect_fail_min_interval_secs")]
    pub redirect_fail_min_interval_secs: u64,
}

fn default_rebalance_interval_ms() -> u64 {
    10
}

fn default_conns_per_loop() -> usize {
    10
}

fn default_max_score_ratio() -> f64 {
    1.2
}

fn default_redirect_fail_min_interval_secs() -> u64 {
    3
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            rebalance_interval_ms: default_rebalance_interval_ms(),
            conns_per_loop: default_conns_per_loop(),
            max_score_ratio: default_max_score_ratio(),
            redirect_fail_min_interval_secs: default_redirect_fail_min_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
    /// Probe failures inside the sliding window before a backend turns unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an unreachable backend is kept before removal
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_check_interval_ms() -> u64 {
    5000
}

fn default_check_timeout_ms() -> u64 {
    3000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_grace_period_secs() -> u64 {
    60
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            check_interval_ms: default_check_interval_ms(),
            check_timeout_ms: default_check_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}
