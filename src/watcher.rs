//! Live filesystem synchronization for the content store.
//!
//! Two watchers run for the lifetime of the store:
//!
//! - the root watcher sees new host directories appear directly under the
//!   store root and hands them to the host watcher;
//! - the host watcher follows every host directory recursively and turns
//!   mock file changes into [`ContentEvent`]s.
//!
//! Each watcher forwards raw notifications into its own channel, drained by
//! a tokio receive loop. Dropping [`Watchers`] stops both loops.

use crate::broadcast::Broadcaster;
use crate::store::{ContentData, ContentEvent, ContentEventType};
use notify::event::{MetadataKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type NotifyRx = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Handles keeping both watchers alive.
pub(crate) struct Watchers {
    _root: Mutex<RecommendedWatcher>,
    _hosts: Arc<Mutex<RecommendedWatcher>>,
}

impl Watchers {
    /// Start watching `root` and every host directory already under it.
    pub(crate) fn start(
        root: &Path,
        events: Broadcaster<ContentEvent>,
    ) -> Result<Self, notify::Error> {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let mut host_watcher = RecommendedWatcher::new(
            move |res| {
                let _ = host_tx.send(res);
            },
            Config::default(),
        )?;

        let mut watched = 0;
        for entry in std::fs::read_dir(root).map_err(notify::Error::io)? {
            let path = entry.map_err(notify::Error::io)?.path();
            if !path.is_dir() {
                continue;
            }
            match host_watcher.watch(&path, RecursiveMode::Recursive) {
                Ok(()) => watched += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to watch host directory"),
            }
        }
        let hosts = Arc::new(Mutex::new(host_watcher));

        let (root_tx, root_rx) = mpsc::unbounded_channel();
        let mut root_watcher = RecommendedWatcher::new(
            move |res| {
                let _ = root_tx.send(res);
            },
            Config::default(),
        )?;
        root_watcher.watch(root, RecursiveMode::NonRecursive)?;

        tokio::spawn(watch_root(
            root.to_path_buf(),
            root_rx,
            Arc::downgrade(&hosts),
            events.clone(),
        ));
        tokio::spawn(watch_hosts(root.to_path_buf(), host_rx, events));

        info!(root = %root.display(), hosts = watched, "Content watchers started");
        Ok(Self {
            _root: Mutex::new(root_watcher),
            _hosts: hosts,
        })
    }
}

/// Follow the store root and register new host directories.
async fn watch_root(
    root: PathBuf,
    mut rx: NotifyRx,
    hosts: Weak<Mutex<RecommendedWatcher>>,
    events: Broadcaster<ContentEvent>,
) {
    while let Some(res) = rx.recv().await {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Root watcher error");
                continue;
            }
        };
        if is_noise(&event.kind) || event.kind.is_remove() {
            continue;
        }
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
        ) {
            continue;
        }

        let Some(hosts) = hosts.upgrade() else {
            break;
        };
        for path in event.paths.iter().filter(|path| path.is_dir()) {
            let result = hosts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .watch(path, RecursiveMode::Recursive);
            match result {
                Ok(()) => {
                    info!(path = %path.display(), "Watching new host directory");
                    // Files written before the watch was in place
                    for data in scan_mocks(&root, path) {
                        events
                            .publish(ContentEvent {
                                kind: ContentEventType::Created,
                                data,
                            })
                            .await;
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to watch host directory"),
            }
        }
    }
    debug!("Root watcher stopped");
}

/// Turn mock file changes under host directories into content events.
async fn watch_hosts(root: PathBuf, mut rx: NotifyRx, events: Broadcaster<ContentEvent>) {
    while let Some(res) = rx.recv().await {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Host watcher error");
                continue;
            }
        };
        for (kind, path) in classify(&event) {
            if kind != ContentEventType::Removed && path.is_dir() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&root) else {
                continue;
            };
            match ContentData::from_relative_path(relative) {
                Ok(data) => {
                    debug!(kind = ?kind, host = %data.host, uri = %data.uri, method = %data.method, "Content changed");
                    events.publish(ContentEvent { kind, data }).await;
                }
                Err(e) => debug!(error = %e, "Ignoring change"),
            }
        }
    }
    debug!("Host watcher stopped");
}

/// Permission, ownership and access notifications carry no content change.
fn is_noise(kind: &EventKind) -> bool {
    match kind {
        EventKind::Access(_) => true,
        EventKind::Modify(ModifyKind::Metadata(meta)) => *meta != MetadataKind::WriteTime,
        _ => false,
    }
}

/// Map a raw notification onto per-path content event kinds.
fn classify(event: &Event) -> Vec<(ContentEventType, &Path)> {
    let all = |kind: ContentEventType| {
        event
            .paths
            .iter()
            .map(|path| (kind, path.as_path()))
            .collect::<Vec<_>>()
    };
    if is_noise(&event.kind) {
        return Vec::new();
    }
    match event.kind {
        EventKind::Remove(_) => all(ContentEventType::Removed),
        EventKind::Create(_) => all(ContentEventType::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(ContentEventType::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
            .paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let kind = if i == 0 {
                    ContentEventType::Removed
                } else {
                    ContentEventType::Created
                };
                (kind, path.as_path())
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => all(ContentEventType::Removed),
        _ => all(ContentEventType::Updated),
    }
}

/// Every mock below `dir`, addressed relative to `root`.
fn scan_mocks(root: &Path, dir: &Path) -> Vec<ContentData> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Some(data) = path
                .strip_prefix(root)
                .ok()
                .and_then(|relative| ContentData::from_relative_path(relative).ok())
            {
                found.push(data);
            }
        }
    }
    found
}
