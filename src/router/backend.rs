use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Health of one backend database instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Healthy,
    /// Reachable but failing probes; kept for attached sessions only
    Unhealthy,
    /// Dial failures; starts the removal grace clock
    CannotConnect,
}

impl BackendStatus {
    /// Score bias. Larger means higher load; selection prefers lower.
    pub fn to_score(self) -> i64 {
        match self {
            BackendStatus::Healthy => 0,
            BackendStatus::Unhealthy => SCORE_BIAS_UNHEALTHY,
            BackendStatus::CannotConnect => SCORE_BIAS_DEAD,
        }
    }
}

pub const SCORE_BIAS_UNHEALTHY: i64 = 10_000;
pub const SCORE_BIAS_DEAD: i64 = 10_000_000;

/// Where a session stands in the redirection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectPhase {
    /// The session was never redirected
    NotRedirected,
    /// A redirect was requested and has not completed yet
    RedirectNotified,
    /// The last redirect succeeded
    RedirectSucceeded,
    /// The last redirect failed; retries are rate limited
    RedirectFailed,
}

/// The router's handle to one live session.
///
/// The session task owns the receiving end of the redirect channel and only
/// looks at it between commands, so a request parked here is picked up at the
/// next safe boundary.
pub struct ConnHandle {
    pub conn_id: u64,
    redirect_tx: mpsc::Sender<String>,
    phase: Mutex<RedirectPhase>,
    last_redirect: Mutex<Option<Instant>>,
}

impl ConnHandle {
    pub fn new(conn_id: u64) -> (Arc<Self>, mpsc::Receiver<String>) {
        // Single-slot: at most one pending redirect per session.
        let (tx, rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                conn_id,
                redirect_tx: tx,
                phase: Mutex::new(RedirectPhase::NotRedirected),
                last_redirect: Mutex::new(None),
            }),
            rx,
        )
    }

    /// Park a redirect request for the session. Returns false when a request
    /// is already pending or the session is gone.
    pub fn request_redirect(&self, target_addr: &str) -> bool {
        if self.redirect_tx.try_send(target_addr.to_string()).is_err() {
            return false;
        }
        *self.phase.lock() = RedirectPhase::RedirectNotified;
        true
    }

    pub fn phase(&self) -> RedirectPhase {
        *self.phase.lock()
    }

    pub fn set_phase(&self, phase: RedirectPhase) {
        *self.phase.lock() = phase;
    }

    pub fn last_redirect(&self) -> Option<Instant> {
        *self.last_redirect.lock()
    }

    pub fn touch_redirect(&self) {
        *self.last_redirect.lock() = Some(Instant::now());
    }
}

/// One backend instance plus the sessions currently attached to it
pub struct BackendWrapper {
    pub addr: String,
    pub status: BackendStatus,
    /// When the current status was entered
    pub status_since: Instant,
    /// conns.len() + incoming redirects - outgoing redirects
    pub conn_score: i64,
    /// Attached sessions ordered by attach time
    pub conns: Vec<Arc<ConnHandle>>,
}

impl BackendWrapper {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            status: BackendStatus::Healthy,
            status_since: Instant::now(),
            conn_score: 0,
            conns: Vec::new(),
        }
    }

    /// Load score used for selection and rebalancing; lower is better
    pub fn score(&self) -> i64 {
        self.status.to_score() + self.conn_score
    }

    pub fn set_status(&mut self, status: BackendStatus) {
        if self.status != status {
            self.status = status;
            self.status_since = Instant::now();
        }
    }

    pub fn remove_conn(&mut self, conn_id: u64) -> Option<Arc<ConnHandle>> {
        let idx = self.conns.iter().position(|c| c.conn_id == conn_id)?;
        Some(self.conns.remove(idx))
    }
}
