mod backend;
mod health;
mod rebalance;

pub use backend::{
    BackendStatus, BackendWrapper, ConnHandle, RedirectPhase, SCORE_BIAS_DEAD,
    SCORE_BIAS_UNHEALTHY,
};
pub use health::{probe_backend, HealthWindow, ProbeOutcome, WindowConfig};
pub use rebalance::spawn_rebalancer;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng as _;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BalanceConfig, HealthCheckConfig};
use crate::metrics::metrics;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no instances to route")]
    NoInstanceToSelect,
}

struct RouterInner {
    backends: HashMap<String, BackendWrapper>,
    /// Tie-break data: when each backend last received an attachment
    last_attach: HashMap<String, Instant>,
}

/// Routes sessions to backends and keeps the connection-count bookkeeping
/// that drives rebalancing.
pub struct Router {
    inner: Mutex<RouterInner>,
    pub(crate) balance: BalanceConfig,
    health_cfg: HealthCheckConfig,
    /// One probe task per backend address
    probe_tokens: DashMap<String, CancellationToken>,
    server_version: RwLock<String>,
    refresh_notify: Notify,
}

/// A point-in-time view of one backend, for the rebalancer and the admin API
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub addr: String,
    pub status: BackendStatus,
    pub conn_score: i64,
    pub score: i64,
    pub conn_count: usize,
}

impl Router {
    pub fn new(balance: BalanceConfig, health_cfg: HealthCheckConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RouterInner {
                backends: HashMap::new(),
                last_attach: HashMap::new(),
            }),
            balance,
            health_cfg,
            probe_tokens: DashMap::new(),
            server_version: RwLock::new(String::new()),
            refresh_notify: Notify::new(),
        })
    }

    /// Latest server version learned from backend handshakes
    pub fn server_version(&self) -> String {
        self.server_version.read().clone()
    }

    pub(crate) fn set_server_version(&self, version: String) {
        *self.server_version.write() = version;
    }

    /// Ask the topology watcher for an immediate refresh
    pub fn refresh_backend(&self) {
        self.refresh_notify.notify_one();
    }

    pub(crate) async fn wait_refresh(&self) {
        self.refresh_notify.notified().await;
    }

    /// Apply the set of currently-alive backend addresses from topology.
    ///
    /// New addresses join as healthy and get a probe task; addresses whose
    /// liveness key disappeared turn cannot-connect and are removed once the
    /// grace period passes with no sessions left.
    pub fn update_backends(self: &Arc<Self>, alive: &[String]) {
        let mut to_spawn = Vec::new();
        {
            let mut inner = self.inner.lock();
            for addr in alive {
                match inner.backends.get_mut(addr) {
                    None => {
                        info!(addr = %addr, "backend discovered");
                        inner
                            .backends
                            .insert(addr.clone(), BackendWrapper::new(addr.clone()));
                        to_spawn.push(addr.clone());
                    }
                    Some(backend) => {
                        // A backend whose liveness key came back rejoins the
                        // healthy pool and gets its probe task back.
                        if !self.probe_tokens.contains_key(addr) {
                            backend.set_status(BackendStatus::Healthy);
                            to_spawn.push(addr.clone());
                        }
                    }
                }
            }
            for (addr, backend) in inner.backends.iter_mut() {
                if !alive.contains(addr) && backend.status != BackendStatus::CannotConnect {
                    info!(addr = %addr, "backend disappeared from topology");
                    backend.set_status(BackendStatus::CannotConnect);
                    if let Some((_, token)) = self.probe_tokens.remove(addr) {
                        token.cancel();
                    }
                }
            }
            self.sweep_removals(&mut inner);
            self.publish_status_gauge(&inner);
        }
        for addr in to_spawn {
            self.spawn_probe(addr);
        }
    }

    /// Drop backends that are unreachable past the grace period and carry no
    /// sessions.
    fn sweep_removals(&self, inner: &mut RouterInner) {
        let grace = Duration::from_secs(self.health_cfg.grace_period_secs);
        let removable: Vec<String> = inner
            .backends
            .values()
            .filter(|b| {
                b.status == BackendStatus::CannotConnect
                    && b.status_since.elapsed() > grace
                    && b.conn_score <= 0
                    && b.conns.is_empty()
            })
            .map(|b| b.addr.clone())
            .collect();
        for addr in removable {
            info!(addr = %addr, "backend removed");
            inner.backends.remove(&addr);
            inner.last_attach.remove(&addr);
            if let Some((_, token)) = self.probe_tokens.remove(&addr) {
                token.cancel();
            }
        }
    }

    fn publish_status_gauge(&self, inner: &RouterInner) {
        let mut healthy = 0;
        let mut unhealthy = 0;
        let mut dead = 0;
        for backend in inner.backends.values() {
            match backend.status {
                BackendStatus::Healthy => healthy += 1,
                BackendStatus::Unhealthy => unhealthy += 1,
                BackendStatus::CannotConnect => dead += 1,
            }
        }
        metrics().set_backend_status(healthy, unhealthy, dead);
    }

    fn spawn_probe(self: &Arc<Self>, addr: String) {
        if !self.health_cfg.enabled {
            return;
        }
        let token = CancellationToken::new();
        self.probe_tokens.insert(addr.clone(), token.clone());

        let interval = Duration::from_millis(self.health_cfg.check_interval_ms);
        let timeout = Duration::from_millis(self.health_cfg.check_timeout_ms);
        let window_cfg = WindowConfig::from_failure_threshold(self.health_cfg.failure_threshold);
        let router: Weak<Router> = Arc::downgrade(self);

        tokio::spawn(async move {
            // Stagger probes so a fleet of backends is not hit in lockstep.
            let jitter = rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64);
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            let mut window = HealthWindow::new(window_cfg);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(addr = %addr, "probe task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(router) = router.upgrade() else { break };
                        let (outcome, version) = probe_backend(&addr, timeout).await;
                        metrics().record_health_check(match outcome {
                            ProbeOutcome::Success => "success",
                            ProbeOutcome::Failure => "failure",
                            ProbeOutcome::Unreachable => "unreachable",
                        });
                        if let Some(version) = version {
                            router.set_server_version(version);
                        }
                        if let Some(status) = window.record(outcome) {
                            warn!(addr = %addr, status = ?status, "backend status changed");
                            let mut inner = router.inner.lock();
                            if let Some(backend) = inner.backends.get_mut(&addr) {
                                backend.set_status(status);
                            }
                            router.publish_status_gauge(&inner);
                        }
                    }
                }
            }
        });
    }

    /// Stateful selector yielding candidate backends in best-first order
    pub fn get_backend_selector(self: &Arc<Self>) -> BackendSelector {
        let inner = self.inner.lock();
        let mut candidates: Vec<(String, i64, Instant)> = inner
            .backends
            .values()
            .filter(|b| b.status == BackendStatus::Healthy)
            .map(|b| {
                let attach = inner
                    .last_attach
                    .get(&b.addr)
                    .copied()
                    .unwrap_or(b.status_since);
                (b.addr.clone(), b.score(), attach)
            })
            .collect();
        // Ascending score; least recently attached first among ties.
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
        BackendSelector {
            router: self.clone(),
            candidates: candidates.into_iter().map(|(addr, _, _)| addr).collect(),
            idx: 0,
        }
    }

    fn reserve(&self, addr: &str) {
        let mut inner = self.inner.lock();
        if let Some(backend) = inner.backends.get_mut(addr) {
            backend.conn_score += 1;
        }
    }

    fn release(&self, addr: &str) {
        let mut inner = self.inner.lock();
        if let Some(backend) = inner.backends.get_mut(addr) {
            backend.conn_score -= 1;
        }
    }

    /// Convert a reservation into an attachment
    pub fn attach_conn(&self, addr: &str, conn: Arc<ConnHandle>) {
        let mut inner = self.inner.lock();
        inner.last_attach.insert(addr.to_string(), Instant::now());
        if let Some(backend) = inner.backends.get_mut(addr) {
            backend.conns.push(conn);
        }
    }

    /// Account an in-flight redirect: one connection moving from -> to
    pub fn begin_redirect(&self, from: &str, to: &str) {
        let mut inner = self.inner.lock();
        if let Some(backend) = inner.backends.get_mut(from) {
            backend.conn_score -= 1;
        }
        if let Some(backend) = inner.backends.get_mut(to) {
            backend.conn_score += 1;
        }
    }

    pub fn on_redirect_succeed(&self, from: &str, to: &str, conn_id: u64) {
        let mut inner = self.inner.lock();
        let moved = inner
            .backends
            .get_mut(from)
            .and_then(|b| b.remove_conn(conn_id));
        if let Some(conn) = moved {
            conn.set_phase(RedirectPhase::RedirectSucceeded);
            conn.touch_redirect();
            inner.last_attach.insert(to.to_string(), Instant::now());
            if let Some(backend) = inner.backends.get_mut(to) {
                backend.conns.push(conn);
            }
        }
        metrics().record_redirect("succeed");
    }

    pub fn on_redirect_fail(&self, from: &str, to: &str, conn_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(backend) = inner.backends.get_mut(to) {
            backend.conn_score -= 1;
        }
        if let Some(backend) = inner.backends.get_mut(from) {
            backend.conn_score += 1;
            if let Some(conn) = backend.conns.iter().find(|c| c.conn_id == conn_id) {
                conn.set_phase(RedirectPhase::RedirectFailed);
                conn.touch_redirect();
            }
        }
        metrics().record_redirect("fail");
    }

    pub fn on_conn_closed(&self, addr: &str, conn_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(backend) = inner.backends.get_mut(addr) {
            backend.remove_conn(conn_id);
            backend.conn_score -= 1;
        }
    }

    /// Total sessions currently attached across all backends
    pub fn conn_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.backends.values().map(|b| b.conns.len()).sum()
    }

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let inner = self.inner.lock();
        inner
            .backends
            .values()
            .map(|b| BackendSnapshot {
                addr: b.addr.clone(),
                status: b.status,
                conn_score: b.conn_score,
                score: b.score(),
                conn_count: b.conns.len(),
            })
            .collect()
    }

    /// Ask every session to move to the currently best backend. Used before
    /// shutdown of a backend set and by the admin surface.
    pub fn redirect_connections(&self) {
        let mut requests = Vec::new();
        {
            let inner = self.inner.lock();
            let Some(best) = inner
                .backends
                .values()
                .filter(|b| b.status == BackendStatus::Healthy)
                .min_by_key(|b| b.score())
                .map(|b| b.addr.clone())
            else {
                return;
            };
            for backend in inner.backends.values() {
                if backend.addr == best {
                    continue;
                }
                for conn in &backend.conns {
                    if conn.phase() != RedirectPhase::RedirectNotified {
                        requests.push((backend.addr.clone(), best.clone(), conn.clone()));
                    }
                }
            }
        }
        for (from, to, conn) in requests {
            self.begin_redirect(&from, &to);
            if !conn.request_redirect(&to) {
                self.on_redirect_fail(&from, &to, conn.conn_id);
            }
        }
    }

    /// Cancel all probe tasks
    pub fn close(&self) {
        for entry in self.probe_tokens.iter() {
            entry.value().cancel();
        }
        self.probe_tokens.clear();
    }

    /// One rebalance pass; extracted from the ticking task for testability
    pub(crate) fn rebalance_once(&self) {
        let fail_min = Duration::from_secs(self.balance.redirect_fail_min_interval_secs);
        let mut requests = Vec::new();
        {
            let inner = self.inner.lock();
            if inner.backends.len() < 2 {
                return;
            }
            let Some(idlest) = inner
                .backends
                .values()
                .filter(|b| b.status == BackendStatus::Healthy)
                .min_by_key(|b| b.score())
            else {
                return;
            };
            let Some(busiest) = inner.backends.values().max_by_key(|b| b.score()) else {
                return;
            };
            if busiest.addr == idlest.addr {
                return;
            }
            let min_score = idlest.score().max(0) as f64;
            let max_score = busiest.score() as f64;
            if max_score <= min_score * self.balance.max_score_ratio {
                return;
            }

            let to = idlest.addr.clone();
            let from = busiest.addr.clone();
            // Longest time since the last redirect first.
            let mut movers: Vec<Arc<ConnHandle>> = busiest
                .conns
                .iter()
                .filter(|c| match c.phase() {
                    RedirectPhase::RedirectNotified => false,
                    RedirectPhase::RedirectFailed => c
                        .last_redirect()
                        .map(|t| t.elapsed() >= fail_min)
                        .unwrap_or(true),
                    _ => true,
                })
                .cloned()
                .collect();
            movers.sort_by_key(|c| c.last_redirect());
            movers.truncate(self.balance.conns_per_loop);
            for conn in movers {
                requests.push((from.clone(), to.clone(), conn));
            }
        }
        for (from, to, conn) in requests {
            debug!(conn_id = conn.conn_id, from = %from, to = %to, "rebalancing session");
            self.begin_redirect(&from, &to);
            if !conn.request_redirect(&to) {
                self.on_redirect_fail(&from, &to, conn.conn_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_backend_for_test(&self, addr: &str, status: BackendStatus) {
        let mut inner = self.inner.lock();
        let mut backend = BackendWrapper::new(addr.to_string());
        backend.set_status(status);
        inner.backends.insert(addr.to_string(), backend);
    }

    #[cfg(test)]
    pub(crate) fn conn_score_for_test(&self, addr: &str) -> i64 {
        self.inner
            .lock()
            .backends
            .get(addr)
            .map(|b| b.conn_score)
            .unwrap_or(i64::MIN)
    }
}

/// Iterator over candidate backends in best-first order.
///
/// `next()` reserves load on the returned candidate; the caller converts the
/// reservation with `attach_conn` on success or releases it with
/// `on_create_fail`.
pub struct BackendSelector {
    router: Arc<Router>,
    candidates: Vec<String>,
    idx: usize,
}

impl BackendSelector {
    pub fn next(&mut self) -> Option<String> {
        let addr = self.candidates.get(self.idx)?.clone();
        self.idx += 1;
        self.router.reserve(&addr);
        Some(addr)
    }

    pub fn on_create_fail(&self, addr: &str) {
        self.router.release(addr);
    }

    pub fn is_exhausted(&self) -> bool {
        self.idx >= self.candidates.len()
    }
}
