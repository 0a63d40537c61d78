//! Error types shared across the crate.

use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the content store.
#[derive(Debug, Error)]
pub enum ContentError {
    /// No mock is stored for the requested triple.
    #[error("mock not found: {method} {host}{uri}")]
    NotFound {
        host: String,
        uri: String,
        method: String,
    },

    /// The (host, uri, method) triple does not map onto a valid store path.
    #[error("invalid mock address: {0}")]
    InvalidAddress(String),

    /// A path under the store root does not describe a mock.
    #[error("path does not describe a mock: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("content store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A config value that breaks one of the data model invariants.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid host name: {0:?}")]
    InvalidHost(String),

    #[error("invalid uri: {0:?}")]
    InvalidUri(String),

    #[error("latency min ({min}ms) exceeds max ({max}ms)")]
    LatencyRange { min: u64, max: u64 },

    #[error("latency p95 ({p95}ms) must lie within [{min}, {max}]")]
    P95OutOfRange { p95: u64, min: u64, max: u64 },

    #[error("latency p99 ({p99}ms) must lie within [{low}, {max}]")]
    P99OutOfRange { p99: u64, low: u64, max: u64 },

    #[error("error status code {0:?} is not an integer in [400, 599]")]
    InvalidStatusCode(String),

    #[error("error percentage for {code} must be in (0, 100], got {percentage}")]
    InvalidPercentage { code: String, percentage: f64 },

    #[error("error percentages sum to {0}, which exceeds 100")]
    PercentageSum(f64),

    #[error("uri rule {0:?} declares neither latency nor errors")]
    EmptyUriRule(String),

    /// Wraps a nested failure with the location it was found at.
    #[error("{location}: {source}")]
    At {
        location: String,
        #[source]
        source: Box<ValidationError>,
    },
}

impl ValidationError {
    /// Attach a location prefix (host, uri, status code) to this error.
    pub fn at(self, location: impl Into<String>) -> Self {
        ValidationError::At {
            location: location.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all location wrappers removed.
    pub fn root(&self) -> &ValidationError {
        match self {
            ValidationError::At { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Failures raised by the hierarchical config store and its loaders.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("host already exists: {0}")]
    HostExists(String),

    #[error("uri {uri} not configured for host {host}")]
    UriNotFound { host: String, uri: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}
