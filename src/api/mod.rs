//! Admin and metrics HTTP surface.
//!
//! Exposes `/api/metrics`, `/api/debug/*`, and a read-only config view.
//! Requests are rate limited globally and may be protected by basic auth.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{ApiConfig, Config};
use crate::metrics::metrics;
use crate::router::Router;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Global token bucket; refilled continuously, drained one token per request
struct RateLimiter {
    state: Mutex<(Instant, f64)>,
    rate: f64,
}

impl RateLimiter {
    fn new(rate_per_sec: u32) -> Self {
        let rate = rate_per_sec.max(1) as f64;
        Self {
            state: Mutex::new((Instant::now(), rate)),
            rate,
        }
    }

    fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.0).as_secs_f64();
        state.0 = now;
        state.1 = (state.1 + elapsed * self.rate).min(self.rate);
        if state.1 >= 1.0 {
            state.1 -= 1.0;
            true
        } else {
            false
        }
    }
}

struct ApiState {
    cfg: ApiConfig,
    router: Arc<Router>,
    /// Serialized once at startup; config hot-reload is out of scope
    config_json: String,
    limiter: RateLimiter,
}

impl ApiState {
    fn authorized(&self, req: &Request<hyper::body::Incoming>) -> bool {
        let (Some(user), Some(password)) =
            (&self.cfg.basic_auth_user, &self.cfg.basic_auth_password)
        else {
            return true;
        };
        let expected = format!(
            "Basic {}",
            BASE64.encode(format!("{user}:{password}"))
        );
        req.headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == expected)
            .unwrap_or(false)
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap()
}

async fn handle_request(
    state: Arc<ApiState>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if !state.limiter.allow() {
        return Ok(text_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded",
        ));
    }
    if !state.authorized(&req) {
        let resp = Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(hyper::header::WWW_AUTHENTICATE, "Basic realm=\"hermes\"")
            .body(Full::new(Bytes::from("unauthorized")))
            .unwrap();
        return Ok(resp);
    }

    match req.uri().path() {
        "/api/metrics" => {
            let body = metrics().gather();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(
                    "Content-Type",
                    "text/plain; version=0.0.4; charset=utf-8",
                )
                .body(Full::new(Bytes::from(body)))
                .unwrap())
        }
        "/api/debug/health" => {
            let body = serde_json::json!({
                "status": "ok",
                "connections": state.router.conn_count(),
                "server_version": state.router.server_version(),
            });
            Ok(text_response(StatusCode::OK, body.to_string()))
        }
        "/api/debug/backends" => {
            let backends: Vec<_> = state
                .router
                .snapshot()
                .into_iter()
                .map(|b| {
                    serde_json::json!({
                        "addr": b.addr,
                        "status": format!("{:?}", b.status),
                        "score": b.score,
                        "conn_score": b.conn_score,
                        "connections": b.conn_count,
                    })
                })
                .collect();
            Ok(text_response(
                StatusCode::OK,
                serde_json::Value::Array(backends).to_string(),
            ))
        }
        "/api/admin/config" => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(state.config_json.clone())))
            .unwrap()),
        "/api/admin/redirect" => {
            state.router.redirect_connections();
            Ok(text_response(StatusCode::OK, "redirect requested"))
        }
        _ => Ok(text_response(StatusCode::NOT_FOUND, "not found")),
    }
}

/// Serve the admin endpoint until shutdown
pub async fn serve(
    cfg: ApiConfig,
    router: Arc<Router>,
    config: &Config,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = cfg.addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "admin endpoint listening");

    let state = Arc::new(ApiState {
        limiter: RateLimiter::new(cfg.rate_limit_per_sec),
        cfg,
        router,
        config_json: serde_json::to_string_pretty(config)?,
    });

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("admin endpoint shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service =
                service_fn(move |req| handle_request(state.clone(), req));
            if let Err(e) = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(HEADER_READ_TIMEOUT)
                .serve_connection(io, service)
                .await
            {
                error!(error = %e, "admin connection error");
            }
        });
    }
}
