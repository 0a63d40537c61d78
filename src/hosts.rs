//! In-memory tree of per-host and per-URI latency/error rules.
//!
//! Readers take lock-free snapshots. Writers serialize on a mutex, apply
//! their change to a copy of the tree, validate the touched host and only
//! then swap the copy in, so a rejected mutation leaves the previous tree
//! untouched.

use crate::config::{
    validate_errors, validate_host, validate_uri, ErrorRules, HostConfig, LatencyConfig,
    UriConfig,
};
use crate::error::{ConfigError, ValidationError};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

type HostTree = HashMap<String, HostConfig>;

/// Shared, concurrently readable host rule tree.
#[derive(Debug, Default)]
pub struct HostsConfig {
    tree: ArcSwap<HostTree>,
    write_lock: Mutex<()>,
}

impl HostsConfig {
    /// Build a store from an initial tree, validating every host.
    pub fn new(hosts: HashMap<String, HostConfig>) -> Result<Self, ValidationError> {
        for (name, host) in &hosts {
            validate_host(name, host)?;
        }
        Ok(Self {
            tree: ArcSwap::from_pointee(hosts),
            write_lock: Mutex::new(()),
        })
    }

    /// A consistent view of the whole tree.
    pub fn snapshot(&self) -> Arc<HashMap<String, HostConfig>> {
        self.tree.load_full()
    }

    /// Names of all configured hosts.
    pub fn hosts(&self) -> Vec<String> {
        self.tree.load().keys().cloned().collect()
    }

    pub fn get_host(&self, name: &str) -> Option<HostConfig> {
        self.tree.load().get(name).cloned()
    }

    /// Add a new host. Fails if the host already exists.
    pub fn add_host(&self, name: &str, config: HostConfig) -> Result<(), ConfigError> {
        validate_host(name, &config)?;
        self.mutate(|tree| {
            if tree.contains_key(name) {
                return Err(ConfigError::HostExists(name.to_string()));
            }
            tree.insert(name.to_string(), config);
            Ok(())
        })?;
        info!(host = %name, "Host added");
        Ok(())
    }

    /// Replace the rules of an existing host.
    pub fn update_host(&self, name: &str, config: HostConfig) -> Result<(), ConfigError> {
        validate_host(name, &config)?;
        self.mutate(|tree| {
            let slot = tree
                .get_mut(name)
                .ok_or_else(|| ConfigError::HostNotFound(name.to_string()))?;
            *slot = config;
            Ok(())
        })?;
        info!(host = %name, "Host updated");
        Ok(())
    }

    /// Remove a host and return its previous rules.
    pub fn delete_host(&self, name: &str) -> Result<HostConfig, ConfigError> {
        let mut removed = None;
        self.mutate(|tree| {
            removed = tree.remove(name);
            if removed.is_none() {
                return Err(ConfigError::HostNotFound(name.to_string()));
            }
            Ok(())
        })?;
        info!(host = %name, "Host deleted");
        removed.ok_or_else(|| ConfigError::HostNotFound(name.to_string()))
    }

    pub fn set_host_latency(&self, name: &str, latency: LatencyConfig) -> Result<(), ConfigError> {
        latency.validate().map_err(|e| e.at(name))?;
        self.mutate_host(name, |host| {
            host.latency = Some(latency);
            Ok(())
        })
    }

    pub fn delete_host_latency(&self, name: &str) -> Result<(), ConfigError> {
        self.mutate_host(name, |host| {
            host.latency = None;
            Ok(())
        })
    }

    pub fn set_host_errors(&self, name: &str, errors: ErrorRules) -> Result<(), ConfigError> {
        validate_errors(&errors).map_err(|e| e.at(name))?;
        self.mutate_host(name, |host| {
            host.errors = errors;
            Ok(())
        })
    }

    pub fn delete_host_errors(&self, name: &str) -> Result<(), ConfigError> {
        self.mutate_host(name, |host| {
            host.errors.clear();
            Ok(())
        })
    }

    /// Insert or replace the override for one URI of a host.
    pub fn set_uri(&self, name: &str, uri: &str, config: UriConfig) -> Result<(), ConfigError> {
        validate_uri(uri, &config).map_err(|e| e.at(name))?;
        self.mutate_host(name, |host| {
            host.uris.insert(uri.to_string(), config);
            Ok(())
        })
    }

    pub fn delete_uri(&self, name: &str, uri: &str) -> Result<(), ConfigError> {
        self.mutate_host(name, |host| match host.uris.remove(uri) {
            Some(_) => Ok(()),
            None => Err(ConfigError::UriNotFound {
                host: name.to_string(),
                uri: uri.to_string(),
            }),
        })
    }

    /// The most specific latency rule for `(host, uri)`.
    pub fn latency_for(&self, host: &str, uri: &str) -> Option<LatencyConfig> {
        let tree = self.tree.load();
        let host = tree.get(host)?;
        uri_candidates(uri)
            .filter_map(|candidate| host.uris.get(candidate))
            .find_map(|rule| rule.latency)
            .or(host.latency)
    }

    /// The error rules for `(host, uri)`. A non-empty URI rule set replaces
    /// the host rule set wholesale.
    pub fn errors_for(&self, host: &str, uri: &str) -> Option<ErrorRules> {
        let tree = self.tree.load();
        let host = tree.get(host)?;
        uri_candidates(uri)
            .filter_map(|candidate| host.uris.get(candidate))
            .map(|rule| &rule.errors)
            .find(|errors| !errors.is_empty())
            .or_else(|| Some(&host.errors).filter(|errors| !errors.is_empty()))
            .cloned()
    }

    fn mutate_host<F>(&self, name: &str, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut HostConfig) -> Result<(), ConfigError>,
    {
        self.mutate(|tree| {
            let host = tree
                .get_mut(name)
                .ok_or_else(|| ConfigError::HostNotFound(name.to_string()))?;
            f(host)?;
            validate_host(name, host)?;
            Ok(())
        })
    }

    fn mutate<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut HostTree) -> Result<(), ConfigError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut tree = HostTree::clone(&self.tree.load());
        f(&mut tree)?;
        self.tree.store(Arc::new(tree));
        Ok(())
    }
}

/// Exact URI first, then the URI without its query string.
fn uri_candidates(uri: &str) -> impl Iterator<Item = &str> {
    std::iter::once(uri).chain(uri.split_once('?').map(|(path, _)| path))
}
