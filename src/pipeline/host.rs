//! Recovers the recorded host for requests addressed by raw IP.

use super::{Next, Request, Response, Stage};
use crate::broadcast::Subscription;
use crate::config::{is_ip_host, is_valid_host};
use crate::error::ContentError;
use crate::store::{ContentData, ContentEvent, ContentEventType, ContentStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

static NEXT_SUBSCRIBER: AtomicUsize = AtomicUsize::new(0);

/// (METHOD, uri) → host the mock was recorded under.
type HostIndex = DashMap<(String, String), String>;

/// Rewrites IP-addressed requests to the host a matching mock lives under.
///
/// The reverse index is seeded from a full listing of the content store and
/// kept current from its change events. The stage never answers on its own.
pub struct HostResolutionStage {
    index: Arc<HostIndex>,
    store: Arc<ContentStore>,
    subscriber_id: String,
    follower: JoinHandle<()>,
}

impl HostResolutionStage {
    pub async fn start(store: Arc<ContentStore>) -> Result<Self, ContentError> {
        let subscriber_id = format!(
            "host-resolution-{}",
            NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed)
        );
        // Subscribe before listing so no change slips between the two
        let subscription = store.subscribe(&subscriber_id, &[]).await;

        let listed = match store.list().await {
            Ok(listed) => listed,
            Err(e) => {
                // Nobody would drain the queue, stalling every publish
                store.unsubscribe(&subscriber_id);
                return Err(e);
            }
        };
        let index = Arc::new(HostIndex::new());
        for data in listed {
            index.insert(index_key(&data), data.host);
        }
        info!(entries = index.len(), "Host index built");

        let follower = tokio::spawn(follow(subscription, index.clone()));
        Ok(Self {
            index,
            store,
            subscriber_id,
            follower,
        })
    }

    /// Host recorded for `(method, uri)`, if any.
    pub fn lookup(&self, method: &str, uri: &str) -> Option<String> {
        self.index
            .get(&(method.to_uppercase(), uri.to_string()))
            .map(|entry| entry.value().clone())
    }
}

impl Drop for HostResolutionStage {
    fn drop(&mut self) {
        self.follower.abort();
        self.store.unsubscribe(&self.subscriber_id);
    }
}

fn index_key(data: &ContentData) -> (String, String) {
    (data.method.to_uppercase(), data.uri.clone())
}

async fn follow(subscription: Subscription<ContentEvent>, index: Arc<HostIndex>) {
    while let Some(event) = subscription.recv().await {
        let key = index_key(&event.data);
        match event.kind {
            ContentEventType::Removed => {
                index.remove_if(&key, |_, host| *host == event.data.host);
            }
            ContentEventType::Created | ContentEventType::Updated => {
                index.insert(key, event.data.host);
            }
        }
    }
    debug!("Host index follower stopped");
}

#[async_trait]
impl Stage for HostResolutionStage {
    fn name(&self) -> &'static str {
        "host-resolution"
    }

    async fn handle(&self, request: &Request, next: Next) -> Option<Response> {
        if is_valid_host(&request.host) && !is_ip_host(&request.host) {
            return next.run(request).await;
        }
        match self.lookup(&request.method, &request.uri) {
            Some(host) => {
                debug!(
                    correlation_id = %request.correlation_id,
                    from = %request.host,
                    to = %host,
                    "Resolved host"
                );
                let resolved = Request {
                    host,
                    ..request.clone()
                };
                next.run(&resolved).await
            }
            None => next.run(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run;
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Answers with the host it was asked for.
    struct EchoHost;

    #[async_trait]
    impl Stage for EchoHost {
        fn name(&self) -> &'static str {
            "echo-host"
        }

        async fn handle(&self, request: &Request, _next: Next) -> Option<Response> {
            Some(Response::new(200, request.host.clone()))
        }
    }

    async fn store_with_mock(dir: &TempDir) -> Arc<ContentStore> {
        let store = Arc::new(ContentStore::open(dir.path()).unwrap());
        store
            .set(&ContentData::new("example.com", "/api/users", "GET"), b"[]")
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_ip_request_resolved() {
        let dir = TempDir::new().unwrap();
        let stage = Arc::new(HostResolutionStage::start(store_with_mock(&dir).await).await.unwrap());

        let request = Request::new("127.0.0.1:8080", "get", "/api/users");
        let response = run(stage, Arc::new(EchoHost), &request).await.unwrap();
        assert_eq!(response.body_str(), "example.com");
    }

    #[tokio::test]
    async fn test_named_host_passes_through() {
        let dir = TempDir::new().unwrap();
        let stage = Arc::new(HostResolutionStage::start(store_with_mock(&dir).await).await.unwrap());

        let request = Request::new("other.com", "GET", "/api/users");
        let response = run(stage, Arc::new(EchoHost), &request).await.unwrap();
        assert_eq!(response.body_str(), "other.com");
    }

    #[tokio::test]
    async fn test_unknown_route_passes_through() {
        let dir = TempDir::new().unwrap();
        let stage = Arc::new(HostResolutionStage::start(store_with_mock(&dir).await).await.unwrap());

        let request = Request::new("10.0.0.1", "POST", "/api/users");
        let response = run(stage, Arc::new(EchoHost), &request).await.unwrap();
        assert_eq!(response.body_str(), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_failed_start_releases_subscription() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("mocks");
        let store = Arc::new(ContentStore::open(&root).unwrap());
        assert!(store.ensure_watching().await);
        std::fs::remove_dir_all(&root).unwrap();

        assert!(HostResolutionStage::start(store.clone()).await.is_err());
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_index_follows_store_changes() {
        let dir = TempDir::new().unwrap();
        let store = store_with_mock(&dir).await;
        let stage = HostResolutionStage::start(store.clone()).await.unwrap();

        store
            .set(&ContentData::new("example.com", "/api/orders", "POST"), b"{}")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while stage.lookup("POST", "/api/orders").is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("created mock never indexed");

        store
            .delete(&ContentData::new("example.com", "/api/users", "GET"))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while stage.lookup("GET", "/api/users").is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("removed mock still indexed");
    }
}
