//! Latency injection.

use super::{Next, Request, Response, Stage};
use crate::hosts::HostsConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Delays responses according to the most specific latency rule.
///
/// The delay budget starts when the stage is entered: time spent by the
/// downstream stages counts against it, and only the remainder is slept.
/// A rule attached to a fired error takes precedence over host/URI rules.
pub struct LatencyStage {
    hosts: Arc<HostsConfig>,
}

impl LatencyStage {
    pub fn new(hosts: Arc<HostsConfig>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl Stage for LatencyStage {
    fn name(&self) -> &'static str {
        "latency"
    }

    async fn handle(&self, request: &Request, next: Next) -> Option<Response> {
        let entered = Instant::now();
        let mut response = next.run(request).await?;

        let rule = response
            .active_error
            .and_then(|fired| fired.rule.latency)
            .or_else(|| self.hosts.latency_for(&request.host, &request.uri));
        let Some(rule) = rule else {
            return Some(response);
        };

        let delay = rule.sample_delay(&mut rand::thread_rng());
        let deadline = entered + delay;
        debug!(
            correlation_id = %request.correlation_id,
            host = %request.host,
            uri = %request.uri,
            delay_ms = delay.as_millis() as u64,
            remaining_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Applying latency"
        );
        tokio::time::sleep_until(deadline).await;

        response.active_latency = Some(rule);
        Some(response)
    }
}
