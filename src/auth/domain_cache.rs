//! Locally cached set of domains registered with the stats authority.
//!
//! Lookups never touch the network. The set is pulled from
//! `{stats_url}/api/sync/domains` at startup and then on a fixed interval;
//! every successful pull is also written to a snapshot file so a restart
//! while the authority is unreachable still has the last known list.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::config::DomainSyncConfig;

const SYNC_SECRET_HEADER: &str = "X-Sync-Secret";

#[derive(Debug, Error)]
pub enum DomainSyncError {
    #[error("failed to request domain list: {0}")]
    Request(#[from] reqwest::Error),
    #[error("domain list endpoint returned {0}")]
    Status(StatusCode),
    #[error("failed to access domain snapshot: {0}")]
    Snapshot(#[from] std::io::Error),
    #[error("failed to decode domain snapshot: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct DomainsResponse {
    domains: Vec<String>,
}

struct Inner {
    domains: RwLock<HashSet<String>>,
    populated: AtomicBool,
    /// Held for a whole refresh so snapshot writes never overlap
    refresh_lock: AsyncMutex<()>,
    client: Client,
    config: DomainSyncConfig,
}

pub struct DomainCache {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
}

impl DomainCache {
    /// Load the initial set (remote first, snapshot as fallback) and start the
    /// refresh loop. Failing both sources is not an error; the cache starts empty.
    pub async fn new(config: DomainSyncConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent("clickresearch-domain-sync/0.1.0")
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("failed to build HTTP client for domain sync")?;

        let (shutdown_tx, _) = watch::channel(false);
        let cache = Self {
            inner: Arc::new(Inner {
                domains: RwLock::new(HashSet::new()),
                populated: AtomicBool::new(false),
                refresh_lock: AsyncMutex::new(()),
                client,
                config,
            }),
            shutdown_tx,
        };

        cache.bootstrap().await;
        cache.spawn_refresh_loop();
        Ok(cache)
    }

    async fn bootstrap(&self) {
        let remote_error = match self.inner.refresh().await {
            Ok(_) => return,
            Err(e) => e,
        };
        warn!("Failed to load domains from stats service: {}", remote_error);

        match self.inner.load_snapshot().await {
            Ok(count) => info!(
                count,
                "Loaded domains from snapshot {}",
                self.inner.config.snapshot_path.display()
            ),
            Err(e) => warn!("No domain snapshot available, starting empty: {}", e),
        }
    }

    fn spawn_refresh_loop(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Duration::from_secs(inner.config.refresh_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = inner.refresh().await {
                            warn!("Domain refresh failed, keeping previous set: {}", e);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Domain refresh loop stopped");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Exact, case-sensitive membership check
    pub fn domain_exists(&self, domain: &str) -> bool {
        self.inner
            .domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(domain)
    }

    /// Pull the list from the stats service now
    pub async fn refresh(&self) -> Result<usize, DomainSyncError> {
        self.inner.refresh().await
    }

    /// Sorted copy of the current set
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .inner
            .domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        domains.sort();
        domains
    }

    pub fn len(&self) -> usize {
        self.inner
            .domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any source (remote or snapshot) has ever loaded a set
    pub fn is_populated(&self) -> bool {
        self.inner.populated.load(Ordering::Acquire)
    }

    /// Stop the refresh loop. A refresh already in flight completes.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for DomainCache {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    async fn refresh(&self) -> Result<usize, DomainSyncError> {
        let _guard = self.refresh_lock.lock().await;
        let url = format!(
            "{}/api/sync/domains",
            self.config.stats_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .header(SYNC_SECRET_HEADER, &self.config.sync_secret)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(DomainSyncError::Status(response.status()));
        }

        let body: DomainsResponse = response.json().await?;
        let count = body.domains.len();
        self.replace(body.domains.iter().cloned());

        if let Err(e) = write_snapshot(&self.config.snapshot_path, &body.domains).await {
            warn!(
                "Failed to write domain snapshot {}: {}",
                self.config.snapshot_path.display(),
                e
            );
        }

        info!(count, "Domain cache refreshed");
        Ok(count)
    }

    async fn load_snapshot(&self) -> Result<usize, DomainSyncError> {
        let bytes = tokio::fs::read(&self.config.snapshot_path).await?;
        let domains: Vec<String> = serde_json::from_slice(&bytes)?;
        let count = domains.len();
        self.replace(domains);
        Ok(count)
    }

    fn replace<I>(&self, domains: I)
    where
        I: IntoIterator<Item = String>,
    {
        let set: HashSet<String> = domains.into_iter().collect();
        *self.domains.write().unwrap_or_else(PoisonError::into_inner) = set;
        self.populated.store(true, Ordering::Release);
    }
}

/// Write the list next to its final path, then rename over it
async fn write_snapshot(path: &Path, domains: &[String]) -> Result<(), DomainSyncError> {
    let json = serde_json::to_vec(domains)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_snapshot_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domains.json");
        std::fs::write(&path, b"stale").unwrap();

        write_snapshot(&path, &["a.com".to_string(), "b.com".to_string()])
            .await
            .unwrap();

        let written: Vec<String> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, vec!["a.com", "b.com"]);
        assert!(!dir.path().join("domains.json.tmp").exists());
    }
}
