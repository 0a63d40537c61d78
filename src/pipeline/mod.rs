//! Request-processing pipeline.
//!
//! # Data Flow
//! ```text
//! Request
//!     → host resolution (IP hosts mapped back to recorded host names)
//!     → latency   (optional, applies its delay on the way back)
//!     → error     (optional, may short-circuit)
//!     → content type
//!     → cache     (optional)
//!     → content   (terminal, reads the content store)
//! Response flows back through the same stages.
//! ```
//!
//! Stages are assembled once into an immutable ordered list owned by the
//! [`Pipeline`]. A stage reaches the rest of the chain only through the
//! [`Next`] cursor it is handed, so the chain cannot be relinked at runtime.

mod cache;
mod content;
mod content_type;
mod fault;
mod host;
mod latency;

pub use cache::{CacheStage, MemoryCache, ResponseCache};
pub use content::ContentStage;
pub use content_type::ContentTypeStage;
pub use fault::ErrorStage;
pub use host::HostResolutionStage;
pub use latency::LatencyStage;

use crate::config::{FiredError, LatencyConfig, Settings};
use crate::hosts::HostsConfig;
use crate::store::ContentStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An inbound request, immutable for the duration of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub host: String,
    pub method: String,
    /// Path plus optional query string
    pub uri: String,
    pub accept: String,
    pub correlation_id: String,
}

impl Request {
    pub fn new(host: impl Into<String>, method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            method: method.into(),
            uri: uri.into(),
            accept: String::new(),
            correlation_id: String::new(),
        }
    }

    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = accept.into();
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }
}

/// A response under construction, threaded back through the stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,

    #[serde(with = "base64_body")]
    pub body: Vec<u8>,

    #[serde(default)]
    pub content_type: Option<String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Error rule that produced this response, for the latency stage
    #[serde(skip)]
    pub active_error: Option<FiredError>,

    /// Latency rule applied to this response
    #[serde(skip)]
    pub active_latency: Option<LatencyConfig>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            content_type: None,
            headers: HashMap::new(),
            active_error: None,
            active_latency: None,
        }
    }

    /// A `{"status": ..., "message": ...}` JSON envelope.
    pub fn envelope(status: u16, outcome: &str, message: &str) -> Self {
        let body = serde_json::to_vec(&Envelope {
            status: outcome,
            message,
        })
        .unwrap_or_default();
        let mut response = Self::new(status, body);
        response.content_type = Some("application/json".to_string());
        response
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    status: &'a str,
    message: &'a str,
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// One link in the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name for logging.
    fn name(&self) -> &'static str;

    /// Produce a response, usually by consulting `next`. `None` means no
    /// stage downstream could answer.
    async fn handle(&self, request: &Request, next: Next) -> Option<Response>;
}

/// Cursor over the stages that follow the current one.
#[derive(Clone)]
pub struct Next {
    stages: Arc<[Arc<dyn Stage>]>,
    position: usize,
}

impl Next {
    /// Run the remainder of the chain. `None` when the chain is exhausted.
    pub async fn run(self, request: &Request) -> Option<Response> {
        let stage = self.stages.get(self.position)?.clone();
        let rest = Next {
            stages: self.stages,
            position: self.position + 1,
        };
        stage.handle(request, rest).await
    }
}

/// The pipeline driver: owns the assembled chain and turns requests into
/// responses.
pub struct Pipeline {
    stages: Arc<[Arc<dyn Stage>]>,
}

impl Pipeline {
    /// Assemble the standard chain. Optional stages are left out according
    /// to the feature flags in `settings`.
    pub async fn new(
        settings: &Settings,
        hosts: Arc<HostsConfig>,
        store: Option<Arc<ContentStore>>,
        cache: Arc<dyn ResponseCache>,
    ) -> Self {
        let mut stages: Vec<Arc<dyn Stage>> = Vec::new();

        if let Some(store) = &store {
            match HostResolutionStage::start(store.clone()).await {
                Ok(stage) => stages.push(Arc::new(stage)),
                Err(e) => warn!(error = %e, "Host resolution disabled"),
            }
        }
        if !settings.disable_latency {
            stages.push(Arc::new(LatencyStage::new(hosts.clone())));
        }
        if !settings.disable_error {
            stages.push(Arc::new(ErrorStage::new(hosts.clone())));
        }
        stages.push(Arc::new(ContentTypeStage::new(
            settings.default_content_type.clone(),
        )));
        if !settings.disable_cache {
            stages.push(Arc::new(CacheStage::new(cache)));
        }
        stages.push(Arc::new(
            ContentStage::new(store).with_headers(settings.response_headers.clone()),
        ));

        Self::from_stages(stages)
    }

    /// A pipeline over an explicit list of stages.
    pub fn from_stages(stages: Vec<Arc<dyn Stage>>) -> Self {
        let names: Vec<&str> = stages.iter().map(|stage| stage.name()).collect();
        info!(stages = ?names, "Pipeline assembled");
        Self {
            stages: stages.into(),
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run one request through the chain.
    pub async fn handle(&self, request: Request) -> Response {
        let next = Next {
            stages: self.stages.clone(),
            position: 0,
        };
        match next.run(&request).await {
            Some(response) => {
                debug!(
                    correlation_id = %request.correlation_id,
                    host = %request.host,
                    method = %request.method,
                    uri = %request.uri,
                    status = response.status,
                    "Request handled"
                );
                response
            }
            None => {
                warn!(
                    correlation_id = %request.correlation_id,
                    host = %request.host,
                    method = %request.method,
                    uri = %request.uri,
                    "No stage produced a response"
                );
                Response::envelope(500, "error", "no response produced")
            }
        }
    }
}
