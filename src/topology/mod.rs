//! Backend discovery and self-registration through the coordination store.
//!
//! Backends announce themselves under `tidb/server/info/<addr>/{ttl,info}`;
//! a backend is routable only while its `ttl` key exists. The proxy
//! announces itself the same way under `tiproxy/topology/<addr>` behind a
//! lease, so a crash erases the keys automatically while a clean shutdown
//! deletes them explicitly.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use etcd_client::{Client, DeleteOptions, GetOptions, PutOptions};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TopologyConfig;
use crate::router::Router;

const BACKEND_TOPOLOGY_PREFIX: &str = "tidb/server/info/";
const PROXY_TOPOLOGY_PREFIX: &str = "tiproxy/topology/";
const TTL_SUFFIX: &str = "/ttl";
const INFO_SUFFIX: &str = "/info";

/// Upper bound for the fetch retry backoff
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("coordination store error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lease expired")]
    LeaseExpired,

    #[error("coordination store operation timed out")]
    Timeout,
}

/// JSON published under the proxy's own `/info` key
#[derive(Debug, Serialize)]
struct ProxyInfo<'a> {
    version: &'a str,
    addr: &'a str,
}

pub struct TopologyWatcher {
    client: Client,
    cfg: TopologyConfig,
    router: Arc<Router>,
    /// The proxy's own advertised address
    self_addr: String,
}

impl TopologyWatcher {
    pub async fn connect(
        cfg: TopologyConfig,
        router: Arc<Router>,
        self_addr: String,
    ) -> Result<Self, TopologyError> {
        let client = Client::connect(cfg.endpoints.clone(), None).await?;
        Ok(Self {
            client,
            cfg,
            router,
            self_addr,
        })
    }

    /// Periodic prefix read of the backend space, feeding deltas to the
    /// router. Retries with exponential backoff while the store is
    /// unreachable; the router keeps operating on last-known topology.
    pub fn spawn_fetch_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let watcher = self.clone();
        let interval = Duration::from_millis(watcher.cfg.fetch_interval_ms.max(1));
        tokio::spawn(async move {
            let mut backoff = interval;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("topology fetch loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                    _ = watcher.router.wait_refresh() => {
                        debug!("topology refresh requested");
                    }
                }
                match watcher.fetch_backends().await {
                    Ok(alive) => {
                        backoff = interval;
                        watcher.router.update_backends(&alive);
                    }
                    Err(err) => {
                        warn!(error = %err, backoff = ?backoff, "topology fetch failed");
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        })
    }

    /// Addresses whose liveness key currently exists
    async fn fetch_backends(&self) -> Result<Vec<String>, TopologyError> {
        let mut client = self.client.clone();
        let resp = client
            .get(
                BACKEND_TOPOLOGY_PREFIX,
                Some(GetOptions::new().with_prefix()),
            )
            .await?;

        let mut alive = BTreeSet::new();
        for kv in resp.kvs() {
            let Ok(key) = kv.key_str() else { continue };
            let Some(rest) = key.strip_prefix(BACKEND_TOPOLOGY_PREFIX) else {
                continue;
            };
            // The `/info` key alone does not make a backend routable.
            if let Some(addr) = rest.strip_suffix(TTL_SUFFIX) {
                alive.insert(addr.to_string());
            }
        }
        Ok(alive.into_iter().collect())
    }

    /// Publish the proxy's own liveness and keep the lease fresh until
    /// shutdown, then erase the keys.
    pub fn spawn_register_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let watcher = self.clone();
        let refresh = Duration::from_millis(watcher.cfg.refresh_interval_ms.max(1));
        tokio::spawn(async move {
            let mut lease_id: Option<i64> = None;
            loop {
                if lease_id.is_none() {
                    match watcher.register().await {
                        Ok(id) => {
                            info!(lease = id, addr = %watcher.self_addr, "proxy registered in topology");
                            lease_id = Some(id);
                        }
                        Err(err) => {
                            warn!(error = %err, "proxy registration failed");
                        }
                    }
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        watcher.deregister(lease_id).await;
                        info!("topology registration shut down cleanly");
                        break;
                    }
                    _ = tokio::time::sleep(refresh) => {
                        if let Some(id) = lease_id {
                            if let Err(err) = watcher.refresh(id).await {
                                warn!(error = %err, "lease refresh failed, re-registering");
                                lease_id = None;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn register(&self) -> Result<i64, TopologyError> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(self.cfg.session_ttl_secs, None)
            .await?;
        let lease_id = lease.id();

        let info = serde_json::to_string(&ProxyInfo {
            version: env!("CARGO_PKG_VERSION"),
            addr: &self.self_addr,
        })?;
        self.put_with_retry(&self.info_key(), info, lease_id).await?;
        self.put_with_retry(&self.ttl_key(), unix_timestamp(), lease_id)
            .await?;
        Ok(lease_id)
    }

    async fn refresh(&self, lease_id: i64) -> Result<(), TopologyError> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        keeper.keep_alive().await?;
        if let Some(resp) = stream.message().await? {
            if resp.ttl() <= 0 {
                return Err(TopologyError::LeaseExpired);
            }
        }
        // The TTL value changes on every refresh while the info stays put.
        self.put_with_retry(&self.ttl_key(), unix_timestamp(), lease_id)
            .await
    }

    async fn deregister(&self, lease_id: Option<i64>) {
        let mut client = self.client.clone();
        let prefix = format!("{}{}", PROXY_TOPOLOGY_PREFIX, self.self_addr);
        let timeout = Duration::from_millis(self.cfg.put_timeout_ms.max(1));
        let _ = tokio::time::timeout(
            timeout,
            client.delete(prefix, Some(DeleteOptions::new().with_prefix())),
        )
        .await;
        if let Some(id) = lease_id {
            let _ = tokio::time::timeout(timeout, client.lease_revoke(id)).await;
        }
    }

    /// A bounded put, retried a fixed number of times with spacing
    async fn put_with_retry(
        &self,
        key: &str,
        value: String,
        lease_id: i64,
    ) -> Result<(), TopologyError> {
        let timeout = Duration::from_millis(self.cfg.put_timeout_ms.max(1));
        let retry_interval = Duration::from_millis(self.cfg.put_retry_interval_ms);
        let mut last_err = None;
        for attempt in 0..self.cfg.put_retry_cnt.max(1) {
            if attempt > 0 {
                tokio::time::sleep(retry_interval).await;
            }
            let mut client = self.client.clone();
            let options = PutOptions::new().with_lease(lease_id);
            match tokio::time::timeout(
                timeout,
                client.put(key, value.clone(), Some(options)),
            )
            .await
            {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(err)) => last_err = Some(TopologyError::Etcd(err)),
                Err(_) => last_err = Some(TopologyError::Timeout),
            }
        }
        Err(last_err.expect("at least one attempt"))
    }

    fn ttl_key(&self) -> String {
        format!("{}{}{}", PROXY_TOPOLOGY_PREFIX, self.self_addr, TTL_SUFFIX)
    }

    fn info_key(&self) -> String {
        format!("{}{}{}", PROXY_TOPOLOGY_PREFIX, self.self_addr, INFO_SUFFIX)
    }
}

fn unix_timestamp() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(BACKEND_TOPOLOGY_PREFIX, "tidb/server/info/");
        assert_eq!(PROXY_TOPOLOGY_PREFIX, "tiproxy/topology/");

        let key = "tidb/server/info/10.0.0.1:4000/ttl";
        let rest = key.strip_prefix(BACKEND_TOPOLOGY_PREFIX).unwrap();
        assert_eq!(rest.strip_suffix(TTL_SUFFIX).unwrap(), "10.0.0.1:4000");

        // The info key alone does not name a routable backend.
        let info_key = "tidb/server/info/10.0.0.1:4000/info";
        let rest = info_key.strip_prefix(BACKEND_TOPOLOGY_PREFIX).unwrap();
        assert!(rest.strip_suffix(TTL_SUFFIX).is_none());
        assert!(rest.strip_suffix(INFO_SUFFIX).is_some());
    }

    #[test]
    fn test_proxy_info_json() {
        let info = ProxyInfo {
            version: "0.3.0",
            addr: "10.0.0.9:6000",
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"version\":\"0.3.0\""));
        assert!(json.contains("\"addr\":\"10.0.0.9:6000\""));
    }
}
