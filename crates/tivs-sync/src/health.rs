//! Portal reachability probes.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use tivs_core::HealthStatus;
use tivs_storage::{store_now, BackoffPolicy, TenderStore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Any HTTP answer means the portal is there; only a success means it works.
pub fn health_for_status(status: StatusCode) -> HealthStatus {
    if status.is_success() || status.is_redirection() {
        HealthStatus::Up
    } else {
        HealthStatus::Degraded
    }
}

#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HealthProbe {
    pub fn new(timeout: Duration, user_agent: &str, backoff: BackoffPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("building portal probe client")?;
        Ok(Self::with_client(client, backoff))
    }

    pub fn with_client(client: reqwest::Client, backoff: BackoffPolicy) -> Self {
        Self { client, backoff }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Self::new(config.http_timeout(), &config.user_agent, config.probe_backoff())
    }

    pub async fn probe(&self, url: &str) -> HealthStatus {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    let health = health_for_status(status);
                    if health == HealthStatus::Up
                        || !can_retry
                        || classify_status(status) == RetryDisposition::NonRetryable
                    {
                        debug!(url, %status, attempt, "portal answered");
                        return health;
                    }
                }
                Err(err) => {
                    if !can_retry || classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        debug!(url, error = %err, attempt, "portal unreachable");
                        return HealthStatus::Down;
                    }
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    /// Probe every active portal concurrently and store the results.
    pub async fn check_portals(&self, store: &TenderStore) -> Result<Vec<(String, HealthStatus)>> {
        let portals = store.list_portals().await?;
        let mut probes = JoinSet::new();
        for portal in portals.into_iter().filter(|p| p.is_active) {
            let probe = self.clone();
            probes.spawn(async move {
                let status = probe.probe(&portal.base_url).await;
                (portal, status)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let (portal, status) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(error = %err, "portal probe task failed");
                    continue;
                }
            };
            store.set_health(portal.id, status, store_now()).await?;
            if status != HealthStatus::Up {
                warn!(portal = %portal.slug, %status, "portal not healthy");
            }
            results.push((portal.slug, status));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        info!(checked = results.len(), "portal health check finished");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::get, Router};
    use tivs_storage::StoreOptions;

    fn quick_probe() -> HealthProbe {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let backoff = BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        HealthProbe::with_client(client, backoff)
    }

    async fn serve() -> String {
        let app = Router::new()
            .route("/ok", get(|| async { "portal home" }))
            .route("/broken", get(|| async { AxumStatus::SERVICE_UNAVAILABLE }))
            .route("/missing", get(|| async { AxumStatus::NOT_FOUND }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// A port that was bound and released, so nothing listens on it.
    async fn closed_port_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/")
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(health_for_status(StatusCode::OK), HealthStatus::Up);
        assert_eq!(health_for_status(StatusCode::FORBIDDEN), HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn probe_maps_responses_to_health() {
        let base = serve().await;
        let probe = quick_probe();
        assert_eq!(probe.probe(&format!("{base}/ok")).await, HealthStatus::Up);
        assert_eq!(probe.probe(&format!("{base}/broken")).await, HealthStatus::Degraded);
        assert_eq!(probe.probe(&format!("{base}/missing")).await, HealthStatus::Degraded);
        assert_eq!(probe.probe(&closed_port_url().await).await, HealthStatus::Down);
    }

    #[tokio::test]
    async fn check_portals_records_health_for_active_portals() {
        let base = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let store = TenderStore::open(StoreOptions::new(dir.path().join("t.db"))).await.unwrap();
        store.ensure_portal("hp", "HP", &format!("{base}/ok"), true).await.unwrap();
        store.ensure_portal("mp", "MP", &closed_port_url().await, true).await.unwrap();
        store.ensure_portal("gj", "GJ", &format!("{base}/ok"), false).await.unwrap();

        let probe = quick_probe();
        let results = probe.check_portals(&store).await.unwrap();
        assert_eq!(
            results,
            vec![("hp".to_string(), HealthStatus::Up), ("mp".to_string(), HealthStatus::Down)]
        );

        let hp = store.get_portal("hp").await.unwrap();
        assert_eq!(hp.health_status, HealthStatus::Up);
        assert!(hp.last_health_check_at.is_some());
        let gj = store.get_portal("gj").await.unwrap();
        assert_eq!(gj.health_status, HealthStatus::Unknown);
    }
}
