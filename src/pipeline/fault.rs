//! Probabilistic error injection.

use super::{Next, Request, Response, Stage};
use crate::config::pick_error;
use crate::hosts::HostsConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Replaces the real response with a configured error status.
///
/// A fired error answers immediately with an empty body and never consults
/// the stages downstream. The fired rule rides along on the response so the
/// latency stage can honor its dedicated delay.
pub struct ErrorStage {
    hosts: Arc<HostsConfig>,
}

impl ErrorStage {
    pub fn new(hosts: Arc<HostsConfig>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl Stage for ErrorStage {
    fn name(&self) -> &'static str {
        "error"
    }

    async fn handle(&self, request: &Request, next: Next) -> Option<Response> {
        let Some(rules) = self.hosts.errors_for(&request.host, &request.uri) else {
            return next.run(request).await;
        };

        let fired = pick_error(&rules, &mut rand::thread_rng());
        match fired {
            Some(fired) => {
                debug!(
                    correlation_id = %request.correlation_id,
                    host = %request.host,
                    uri = %request.uri,
                    status = fired.status,
                    "Injecting error"
                );
                let mut response = Response::new(fired.status, Vec::new());
                response.active_error = Some(fired);
                Some(response)
            }
            None => next.run(request).await,
        }
    }
}
