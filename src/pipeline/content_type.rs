//! Content type negotiation from the Accept header.

use super::{Next, Request, Response, Stage};
use async_trait::async_trait;

/// Fills in a content type for responses that do not carry one yet.
pub struct ContentTypeStage {
    default_content_type: String,
}

impl ContentTypeStage {
    pub fn new(default_content_type: impl Into<String>) -> Self {
        Self {
            default_content_type: default_content_type.into(),
        }
    }

    /// Pick a content type for an Accept header value.
    ///
    /// An empty header or `*/*` yields the default; otherwise the first
    /// listed media type is used verbatim, minus its `q` weight.
    pub fn negotiate(&self, accept: &str) -> String {
        let accept = accept.trim();
        if accept.is_empty() || accept == "*/*" {
            return self.default_content_type.clone();
        }
        let first = accept.split(',').next().unwrap_or(accept);
        let media_type = first
            .split(';')
            .filter(|param| !is_weight(param))
            .collect::<Vec<_>>()
            .join(";");
        let media_type = media_type.trim();
        if media_type.is_empty() {
            self.default_content_type.clone()
        } else {
            media_type.to_string()
        }
    }
}

fn is_weight(param: &str) -> bool {
    param
        .split_once('=')
        .is_some_and(|(name, _)| name.trim().eq_ignore_ascii_case("q"))
}

#[async_trait]
impl Stage for ContentTypeStage {
    fn name(&self) -> &'static str {
        "content-type"
    }

    async fn handle(&self, request: &Request, next: Next) -> Option<Response> {
        let mut response = next.run(request).await?;
        if response.content_type.is_none() {
            response.content_type = Some(self.negotiate(&request.accept));
        }
        Some(response)
    }
}
