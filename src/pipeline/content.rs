//! Terminal stage serving mock bodies from the content store.

use super::{Next, Request, Response, Stage};
use crate::error::ContentError;
use crate::store::{ContentData, ContentStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct ContentStage {
    store: Option<Arc<ContentStore>>,
    headers: HashMap<String, String>,
}

impl ContentStage {
    pub fn new(store: Option<Arc<ContentStore>>) -> Self {
        Self {
            store,
            headers: HashMap::new(),
        }
    }

    /// Headers attached to every mock served.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
impl Stage for ContentStage {
    fn name(&self) -> &'static str {
        "content"
    }

    async fn handle(&self, request: &Request, _next: Next) -> Option<Response> {
        let Some(store) = &self.store else {
            warn!(correlation_id = %request.correlation_id, "No content store configured");
            return Some(Response::envelope(
                500,
                "error",
                "content store not configured",
            ));
        };

        let data = ContentData::new(&request.host, &request.uri, &request.method);
        match store.get(&data).await {
            Ok(body) => {
                let mut response = Response::new(200, body);
                response.headers = self.headers.clone();
                Some(response)
            }
            Err(ContentError::NotFound { .. }) | Err(ContentError::InvalidAddress(_)) => {
                debug!(
                    correlation_id = %request.correlation_id,
                    host = %request.host,
                    method = %request.method,
                    uri = %request.uri,
                    "Mock not found"
                );
                Some(Response::envelope(404, "fail", "mock not found"))
            }
            Err(e) => {
                error!(
                    correlation_id = %request.correlation_id,
                    host = %request.host,
                    uri = %request.uri,
                    error = %e,
                    "Failed to read mock"
                );
                Some(Response::envelope(500, "error", "failed to read mock"))
            }
        }
    }
}
