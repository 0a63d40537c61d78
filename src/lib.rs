//! Service Virtualizer
//!
//! Stands in for real HTTP dependencies by serving recorded mock bodies
//! from a directory tree, optionally slowed down or replaced by errors
//! according to per-host and per-URI rules.
//!
//! # Features
//!
//! - **Filesystem Mocks**: `<mocks_dir>/<host>/<uri segments>.<method>` files served verbatim
//! - **Live Reload**: Changes on disk are picked up and published as events
//! - **Latency Simulation**: Uniform delays with optional p95/p99 tails
//! - **Error Injection**: Status codes fired with configured probabilities
//! - **Response Caching**: Cached responses served immediately, refreshed in the background
//! - **Host Resolution**: Requests addressed by IP mapped back to the recorded host
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   mocks_dir: /var/lib/mocks
//!   default_content_type: application/json
//!
//! hosts:
//!   api.example.com:
//!     latency:
//!       min: 10
//!       p95: 200
//!       max: 500
//!     errors:
//!       "503":
//!         percentage: 5
//!     uris:
//!       /api/orders:
//!         errors:
//!           "500":
//!             percentage: 20
//!             latency:
//!               min: 1000
//!               max: 2000
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod hosts;
pub mod pipeline;
pub mod store;
mod watcher;

pub use broadcast::{Broadcaster, Subscription};
pub use config::ServerConfig;
pub use error::{ConfigError, ContentError, ValidationError};
pub use hosts::HostsConfig;
pub use pipeline::{Pipeline, Request, Response};
pub use store::{ContentData, ContentEvent, ContentEventType, ContentStore};
