//! Filesystem-backed mock content store.
//!
//! Mocks live under `<root>/<host>/<uri path segments>[?<query>].<method>`.
//! The `/` URI (and any URI ending in `/` without a query) is stored under
//! the reserved leaf name `root`.
//!
//! The store watches its root once it is first used and publishes a
//! [`ContentEvent`] for every mock created, updated or removed on disk,
//! whoever made the change.

use crate::broadcast::{Broadcaster, Predicate, Subscription};
use crate::config::{is_valid_host, is_valid_method, is_valid_uri};
use crate::error::ContentError;
use crate::watcher::Watchers;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Leaf name standing in for a URI that ends in `/`.
const ROOT_LEAF: &str = "root";

/// Identifies one stored mock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentData {
    pub host: String,
    pub uri: String,
    pub method: String,
}

impl ContentData {
    pub fn new(host: impl Into<String>, uri: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            uri: uri.into(),
            method: method.into(),
        }
    }

    /// Path of this mock relative to the store root.
    pub fn to_relative_path(&self) -> Result<PathBuf, ContentError> {
        if !is_valid_host(&self.host) || !is_valid_uri(&self.uri) || !is_valid_method(&self.method)
        {
            return Err(ContentError::InvalidAddress(format!(
                "{} {}{}",
                self.method, self.host, self.uri
            )));
        }

        let (path, query) = match self.uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (self.uri.as_str(), None),
        };

        let mut relative = PathBuf::from(&self.host);
        let mut segments: Vec<&str> = path[1..].split('/').collect();
        let leaf = segments.pop().unwrap_or_default();
        for segment in segments {
            relative.push(segment);
        }

        let mut leaf = match (leaf, query) {
            ("", None) => ROOT_LEAF.to_string(),
            (leaf, None) => leaf.to_string(),
            (leaf, Some(query)) => format!("{}?{}", leaf, query),
        };
        leaf.push('.');
        leaf.push_str(&self.method.to_lowercase());
        relative.push(leaf);
        Ok(relative)
    }

    /// Recover a mock address from a path relative to the store root.
    pub fn from_relative_path(relative: &Path) -> Result<Self, ContentError> {
        let invalid = || ContentError::InvalidPath(relative.to_path_buf());

        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => segments.push(segment.to_str().ok_or_else(invalid)?),
                _ => return Err(invalid()),
            }
        }
        if segments.len() < 2 {
            return Err(invalid());
        }

        let host = segments[0];
        let leaf_file = segments[segments.len() - 1];
        let (leaf, extension) = leaf_file.rsplit_once('.').ok_or_else(invalid)?;
        // Extensions are written lower-case; anything else is not ours
        if !is_valid_method(extension) || extension.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(invalid());
        }

        let mut uri = String::from("/");
        for dir in &segments[1..segments.len() - 1] {
            uri.push_str(dir);
            uri.push('/');
        }
        if leaf != ROOT_LEAF {
            uri.push_str(leaf);
        }

        if !is_valid_host(host) || !is_valid_uri(&uri) {
            return Err(invalid());
        }
        Ok(Self::new(host, uri, extension.to_uppercase()))
    }
}

/// Kind of change seen on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentEventType {
    Created,
    Updated,
    Removed,
}

/// A change to one stored mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEvent {
    pub kind: ContentEventType,
    pub data: ContentData,
}

/// Mock bodies on disk, with change notification.
pub struct ContentStore {
    root: PathBuf,
    events: Broadcaster<ContentEvent>,
    watchers: OnceCell<Option<Watchers>>,
}

impl ContentStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ContentError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        info!(root = %root.display(), "Content store opened");
        Ok(Self {
            root,
            events: Broadcaster::new(),
            watchers: OnceCell::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start the filesystem watchers once; later calls return immediately.
    ///
    /// Returns whether live reload is active. A watcher setup failure is
    /// logged and leaves live reload off for the lifetime of the store.
    pub async fn ensure_watching(&self) -> bool {
        self.watchers
            .get_or_init(|| async {
                match Watchers::start(&self.root, self.events.clone()) {
                    Ok(watchers) => Some(watchers),
                    Err(e) => {
                        warn!(root = %self.root.display(), error = %e, "Live reload disabled");
                        None
                    }
                }
            })
            .await
            .is_some()
    }

    /// Read a mock body.
    pub async fn get(&self, data: &ContentData) -> Result<Vec<u8>, ContentError> {
        self.ensure_watching().await;
        let path = self.root.join(data.to_relative_path()?);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(data)),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a mock body, creating parent directories as needed.
    pub async fn set(&self, data: &ContentData, body: &[u8]) -> Result<(), ContentError> {
        self.ensure_watching().await;
        let path = self.root.join(data.to_relative_path()?);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        debug!(host = %data.host, uri = %data.uri, method = %data.method, "Mock stored");
        Ok(())
    }

    /// Remove a mock.
    pub async fn delete(&self, data: &ContentData) -> Result<(), ContentError> {
        self.ensure_watching().await;
        let path = self.root.join(data.to_relative_path()?);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(host = %data.host, uri = %data.uri, method = %data.method, "Mock deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(data)),
            Err(e) => Err(e.into()),
        }
    }

    /// Every mock currently on disk. Paths that do not describe a mock are skipped.
    pub async fn list(&self) -> Result<Vec<ContentData>, ContentError> {
        self.ensure_watching().await;
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                match ContentData::from_relative_path(relative) {
                    Ok(data) => found.push(data),
                    Err(e) => debug!(error = %e, "Skipping entry"),
                }
            }
        }
        Ok(found)
    }

    /// Subscribe to change events of the given kinds (all kinds when empty).
    pub async fn subscribe(
        &self,
        id: &str,
        kinds: &[ContentEventType],
    ) -> Subscription<ContentEvent> {
        self.ensure_watching().await;
        let kinds = kinds.to_vec();
        let predicate: Predicate<ContentEvent> =
            Arc::new(move |event: &ContentEvent| kinds.is_empty() || kinds.contains(&event.kind));
        self.events.subscribe(id, Some(predicate))
    }

    pub fn unsubscribe(&self, id: &str) {
        self.events.unsubscribe(id);
    }

    /// Number of live event subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }
}

impl Drop for ContentStore {
    fn drop(&mut self) {
        self.events.close();
    }
}

fn not_found(data: &ContentData) -> ContentError {
    ContentError::NotFound {
        host: data.host.clone(),
        uri: data.uri.clone(),
        method: data.method.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn round_trip(host: &str, uri: &str, method: &str) -> ContentData {
        let data = ContentData::new(host, uri, method);
        let path = data.to_relative_path().unwrap();
        ContentData::from_relative_path(&path).unwrap()
    }

    #[test]
    fn test_path_mapping() {
        let cases = [
            ("example.com", "/api/users", "GET", "example.com/api/users.get"),
            ("example.com", "/", "GET", "example.com/root.get"),
            ("example.com", "/api/", "POST", "example.com/api/root.post"),
            ("example.com", "/api?page=1", "GET", "example.com/api?page=1.get"),
            ("example.com", "/files/a.json", "PUT", "example.com/files/a.json.put"),
        ];
        for (host, uri, method, expected) in cases {
            let data = ContentData::new(host, uri, method);
            assert_eq!(data.to_relative_path().unwrap(), PathBuf::from(expected));
        }
    }

    #[test]
    fn test_path_round_trip() {
        let cases = [
            ("example.com", "/api/users", "GET"),
            ("example.com", "/", "GET"),
            ("localhost:8080", "/api/users/", "DELETE"),
            ("example.com", "/search?q=rust&page=2", "GET"),
            ("example.com", "/?debug=1", "OPTIONS"),
            ("example.com", "/v1/items/a.json", "PATCH"),
        ];
        for (host, uri, method) in cases {
            assert_eq!(round_trip(host, uri, method), ContentData::new(host, uri, method));
        }
    }

    #[test]
    fn test_reverse_mapping_rejects_garbage() {
        for path in [
            "example.com",
            "example.com/noextension",
            "example.com/users.g3t",
            "example.com/users.GET",
            "bad host/users.get",
            "example.com/../users.get",
            "/etc/passwd.get",
        ] {
            assert!(
                ContentData::from_relative_path(Path::new(path)).is_err(),
                "{} should not parse",
                path
            );
        }
    }

    #[test]
    fn test_invalid_address_rejected() {
        let data = ContentData::new("example.com", "/../etc/passwd", "GET");
        assert!(matches!(
            data.to_relative_path(),
            Err(ContentError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let data = ContentData::new("example.com", "/api/users", "GET");

        assert!(matches!(
            store.get(&data).await,
            Err(ContentError::NotFound { .. })
        ));

        store.set(&data, br#"{"ok":true}"#).await.unwrap();
        assert_eq!(store.get(&data).await.unwrap(), br#"{"ok":true}"#);
        assert!(dir.path().join("example.com/api/users.get").is_file());

        store.set(&data, b"v2").await.unwrap();
        assert_eq!(store.get(&data).await.unwrap(), b"v2");

        store.delete(&data).await.unwrap();
        assert!(matches!(
            store.delete(&data).await,
            Err(ContentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_skips_unparseable_entries() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        store
            .set(&ContentData::new("a.com", "/", "GET"), b"root")
            .await
            .unwrap();
        store
            .set(&ContentData::new("b.com", "/x/y", "POST"), b"xy")
            .await
            .unwrap();
        std::fs::write(dir.path().join("a.com/README"), b"not a mock").unwrap();
        std::fs::write(dir.path().join("stray.get"), b"no host").unwrap();

        let mut listed = store.list().await.unwrap();
        listed.sort_by(|a, b| a.host.cmp(&b.host));
        assert_eq!(
            listed,
            vec![
                ContentData::new("a.com", "/", "GET"),
                ContentData::new("b.com", "/x/y", "POST"),
            ]
        );
    }

    #[tokio::test]
    async fn test_watcher_publishes_changes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("example.com")).unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let events = store
            .subscribe("test", &[ContentEventType::Created, ContentEventType::Removed])
            .await;
        assert!(store.ensure_watching().await);

        let data = ContentData::new("example.com", "/watched", "GET");
        std::fs::write(dir.path().join("example.com/watched.get"), b"hi").unwrap();

        let created = timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(event) if event.data == data => return event,
                    Some(_) => continue,
                    None => panic!("subscription closed"),
                }
            }
        })
        .await
        .expect("no create event");
        assert_eq!(created.kind, ContentEventType::Created);

        std::fs::remove_file(dir.path().join("example.com/watched.get")).unwrap();
        let removed = timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(event) if event.kind == ContentEventType::Removed => return event,
                    Some(_) => continue,
                    None => panic!("subscription closed"),
                }
            }
        })
        .await
        .expect("no remove event");
        assert_eq!(removed.data, data);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_starts_one_watcher() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("example.com")).unwrap();
        let store = Arc::new(ContentStore::open(dir.path()).unwrap());

        let mut racers = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let store = store.clone();
            racers.spawn(async move { store.ensure_watching().await });
        }
        while let Some(started) = racers.join_next().await {
            assert!(started.unwrap());
        }

        let events = store.subscribe("test", &[ContentEventType::Created]).await;
        let data = ContentData::new("example.com", "/once", "GET");
        std::fs::write(dir.path().join("example.com/once.get"), b"1").unwrap();

        let mut created = 0;
        while let Ok(Some(event)) = timeout(Duration::from_millis(500), events.recv()).await {
            if event.data == data {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_drop_closes_subscriptions() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let events = store.subscribe("test", &[]).await;
        drop(store);
        let next = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
        assert!(next.is_none());
    }
}
