use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use hermes::api;
use hermes::config::{self, Config};
use hermes::metrics::metrics;
use hermes::protocol::read_proxy_header;
use hermes::router::{spawn_rebalancer, Router};
use hermes::security::CertInfo;
use hermes::session::ClientSession;
use hermes::topology::TopologyWatcher;

/// Global counter for session / connection IDs
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_config()?;

    // TLS material for both directions; bad cert files are fatal.
    let frontend_tls = Arc::new(CertInfo::new_server(config.security.frontend.clone()));
    frontend_tls.reload()?;
    let backend_tls = Arc::new(CertInfo::new_client(config.security.backend.clone()));
    backend_tls.reload()?;

    let shutdown = CancellationToken::new();
    let router = Router::new(config.balance.clone(), config.health.clone());

    if config.topology.endpoints.is_empty() {
        info!(
            backends = ?config.topology.static_backends,
            "using static backend topology"
        );
        router.update_backends(&config.topology.static_backends);
    } else {
        let watcher = Arc::new(
            TopologyWatcher::connect(
                config.topology.clone(),
                router.clone(),
                config.proxy.addr.clone(),
            )
            .await?,
        );
        watcher.spawn_fetch_loop(shutdown.clone());
        watcher.spawn_register_loop(shutdown.clone());
    }

    let rebalancer = spawn_rebalancer(router.clone(), shutdown.clone());

    {
        let api_cfg = config.api.clone();
        let api_router = router.clone();
        let api_shutdown = shutdown.clone();
        let api_config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(api_cfg, api_router, &api_config, api_shutdown).await {
                error!(error = %e, "admin endpoint failed");
            }
        });
    }

    let listener = TcpListener::bind(&config.proxy.addr).await?;
    info!(addr = %config.proxy.addr, "hermes proxy listening");

    let proxy_cfg = Arc::new(config.proxy.clone());
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }

            accepted = listener.accept() => {
                let (mut stream, peer_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let session_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
                let router = router.clone();
                let frontend_tls = frontend_tls.clone();
                let backend_tls = backend_tls.clone();
                let proxy_cfg = proxy_cfg.clone();
                let session_shutdown = shutdown.clone();

                metrics().record_connection_accepted();

                sessions.spawn(async move {
                    let client_addr = if proxy_cfg.proxy_protocol {
                        match read_proxy_header(&mut stream).await {
                            Ok(Some(addr)) => addr,
                            Ok(None) => peer_addr,
                            Err(err) => {
                                warn!(peer = %peer_addr, error = %err, "bad proxy protocol header");
                                metrics().record_connection_closed();
                                return;
                            }
                        }
                    } else {
                        peer_addr
                    };

                    let session = ClientSession::new(
                        session_id,
                        router,
                        frontend_tls,
                        backend_tls,
                        proxy_cfg,
                        session_shutdown,
                    );
                    if let Err(e) = session.run(stream, client_addr).await {
                        warn!(session_id = session_id, error = %e, "session ended with error");
                    }
                    metrics().record_connection_closed();
                });
            }

            Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = result {
                    if e.is_panic() {
                        metrics().record_task_panic();
                        error!(error = %e, "session task panicked");
                    }
                }
            }
        }
    }

    // Let sessions finish their current command, then drain.
    shutdown.cancel();
    let active = sessions.len();
    if active > 0 {
        let drain = Duration::from_secs(config.proxy.graceful_wait_secs);
        info!(active_sessions = active, timeout_secs = drain.as_secs(), "draining sessions");
        let deadline = tokio::time::Instant::now() + drain;

        loop {
            if sessions.is_empty() {
                info!("all sessions drained");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(remaining = sessions.len(), "drain deadline reached, aborting sessions");
                    sessions.abort_all();
                    break;
                }
                Some(result) = sessions.join_next() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            metrics().record_task_panic();
                            error!(error = %e, "session task panicked during drain");
                        }
                    }
                }
            }
        }
    }

    router.close();
    rebalancer.abort();
    info!("hermes proxy shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Load configuration; an explicit path must parse, and a broken file at a
/// conventional location is fatal rather than silently ignored.
fn load_config() -> anyhow::Result<Config> {
    if let Ok(path) = std::env::var("HERMES_CONFIG") {
        let config = config::load_config(&path)?;
        info!(path = %path, "loaded configuration");
        return Ok(config);
    }

    for path in ["config/hermes.toml", "hermes.toml"] {
        if std::path::Path::new(path).exists() {
            let config = config::load_config(path)?;
            info!(path = path, "loaded configuration");
            return Ok(config);
        }
    }

    anyhow::bail!(
        "no configuration found; set HERMES_CONFIG or create hermes.toml \
         (topology.static_backends or topology.endpoints is required)"
    )
}
