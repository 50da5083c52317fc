//! Backend health probing.
//!
//! Each backend gets a long-running probe task. Results feed a sliding
//! window so transient jitter does not flap the routing status.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::protocol::{InitialHandshake, PacketIO};

use super::backend::BackendStatus;

/// Result of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Dial + handshake read succeeded
    Success,
    /// Dialed but the handshake was missing or malformed
    Failure,
    /// Dial failed or timed out
    Unreachable,
}

/// Sliding window configuration for status transitions
#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub window_size: usize,
    /// Results of one kind needed to enter the matching status
    pub threshold: usize,
    /// Minimum samples before leaving the initial status
    pub min_samples: usize,
}

impl WindowConfig {
    pub fn from_failure_threshold(threshold: u32) -> Self {
        let threshold = threshold.max(1) as usize;
        Self {
            window_size: threshold * 2,
            threshold,
            min_samples: (threshold / 2).max(1),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self::from_failure_threshold(5)
    }
}

/// Sliding window of probe results driving one backend's status
#[derive(Debug)]
pub struct HealthWindow {
    window: VecDeque<ProbeOutcome>,
    config: WindowConfig,
    status: BackendStatus,
}

impl HealthWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            config,
            // Discovered backends are routable until proven otherwise.
            status: BackendStatus::Healthy,
        }
    }

    pub fn status(&self) -> BackendStatus {
        self.status
    }

    /// Record one probe result. Returns the new status if it changed.
    pub fn record(&mut self, outcome: ProbeOutcome) -> Option<BackendStatus> {
        if self.window.len() >= self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(outcome);

        let old = self.status;
        self.status = self.calculate();
        (old != self.status).then_some(self.status)
    }

    fn count(&self, outcome: ProbeOutcome) -> usize {
        self.window.iter().filter(|o| **o == outcome).count()
    }

    fn calculate(&self) -> BackendStatus {
        if self.window.len() < self.config.min_samples {
            return self.status;
        }
        let success = self.count(ProbeOutcome::Success);
        let failure = self.count(ProbeOutcome::Failure);
        let unreachable = self.count(ProbeOutcome::Unreachable);

        if unreachable >= self.config.threshold {
            BackendStatus::CannotConnect
        } else if failure + unreachable >= self.config.threshold {
            BackendStatus::Unhealthy
        } else if success >= self.config.threshold {
            BackendStatus::Healthy
        } else {
            self.status
        }
    }
}

/// Probe one backend: dial, read its initial handshake, hang up.
///
/// Returns the outcome and the server version when the handshake parsed.
pub async fn probe_backend(addr: &str, timeout: Duration) -> (ProbeOutcome, Option<String>) {
    let connect = tokio::time::timeout(timeout, TcpStream::connect(addr)).await;
    let stream = match connect {
        Ok(Ok(stream)) => stream,
        _ => return (ProbeOutcome::Unreachable, None),
    };

    let mut io = PacketIO::new(stream);
    let handshake = tokio::time::timeout(timeout, io.read_packet()).await;
    let _ = io.close().await;

    match handshake {
        Ok(Ok(payload)) => match InitialHandshake::parse(&payload) {
            Some(hs) => (ProbeOutcome::Success, Some(hs.server_version)),
            None => (ProbeOutcome::Failure, None),
        },
        _ => (ProbeOutcome::Failure, None),
    }
}
