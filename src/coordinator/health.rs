//! Member health probing

use crate::common::Result;
use crate::coordinator::member::Member;
use futures_util::future::join_all;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Path every member serves for liveness probes
pub const HEALTH_PATH: &str = "/pd/ping";

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct HealthChecker {
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Probe all members concurrently and return the unhealthy ones keyed
    /// by member id. A member is healthy if any of its client URLs answers
    /// the ping with `200 OK`.
    pub async fn check_health(&self, members: &[Member]) -> BTreeMap<u64, Member> {
        let probes = members.iter().map(|m| async move {
            let healthy = self.probe_member(m).await;
            (m, healthy)
        });

        join_all(probes)
            .await
            .into_iter()
            .filter(|(_, healthy)| !healthy)
            .map(|(m, _)| (m.member_id, m.clone()))
            .collect()
    }

    async fn probe_member(&self, member: &Member) -> bool {
        let results = join_all(member.client_urls.iter().map(|url| self.probe(url))).await;
        let healthy = results.into_iter().any(|ok| ok);
        if !healthy {
            warn!("member {} is unhealthy", member);
        }
        healthy
    }

    async fn probe(&self, url: &str) -> bool {
        let target = format!("{}{}", url.trim_end_matches('/'), HEALTH_PATH);
        match self.client.get(&target).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => true,
            Ok(resp) => {
                debug!("ping {} returned {}", target, resp.status());
                false
            }
            Err(e) => {
                debug!("ping {} failed: {}", target, e);
                false
            }
        }
    }
}
