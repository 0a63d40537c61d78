//! Configuration for the service virtualizer.
//!
//! Defines process settings, the per-host latency/error rule tree, the
//! grammars hosts and URIs must follow, and the random draws used to
//! inject latency and errors.

use crate::error::{ConfigError, ValidationError};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Error rules keyed by HTTP status code (as a string, e.g. `"503"`).
pub type ErrorRules = HashMap<String, ErrorConfig>;

/// Percent of draws reserved for the `[p99, max]` band.
const P99_TAIL_PERCENT: u32 = 1;

/// Percent of draws reserved for the `[p95, p99-or-max]` band.
const P95_TAIL_PERCENT: u32 = 5;

/// Tolerance used when summing float percentages.
const PERCENT_EPSILON: f64 = 1e-9;

/// Root configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Process-wide settings
    #[serde(default)]
    pub settings: Settings,

    /// Latency/error rules per host
    #[serde(default)]
    pub hosts: HashMap<String, HostConfig>,
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every host rule in the configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, host) in &self.hosts {
            validate_host(name, host)?;
        }
        Ok(())
    }
}

/// Process settings, fixed for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Directory holding the mock bodies
    #[serde(default = "default_mocks_dir")]
    pub mocks_dir: PathBuf,

    /// Content type used when the request accepts anything
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// Leave the latency stage out of the pipeline
    #[serde(default)]
    pub disable_latency: bool,

    /// Leave the error stage out of the pipeline
    #[serde(default)]
    pub disable_error: bool,

    /// Leave the cache stage out of the pipeline
    #[serde(default)]
    pub disable_cache: bool,

    /// Extra headers attached to every served mock (e.g. CORS)
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mocks_dir: default_mocks_dir(),
            default_content_type: default_content_type(),
            disable_latency: false,
            disable_error: false,
            disable_cache: false,
            response_headers: HashMap::new(),
        }
    }
}

fn default_mocks_dir() -> PathBuf {
    PathBuf::from("mocks")
}

fn default_content_type() -> String {
    "application/json".to_string()
}

/// Rules for one host.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Latency applied to every URI of the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyConfig>,

    /// Errors injected for every URI of the host
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub errors: ErrorRules,

    /// Narrower overrides keyed by URI
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub uris: HashMap<String, UriConfig>,
}

/// Override rules for a single URI of a host.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UriConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyConfig>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub errors: ErrorRules,
}

/// Latency distribution, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LatencyConfig {
    pub min: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p99: Option<u64>,

    pub max: u64,
}

impl LatencyConfig {
    /// A uniform `[min, max]` rule without percentiles.
    pub fn range(min: u64, max: u64) -> Self {
        Self {
            min,
            p95: None,
            p99: None,
            max,
        }
    }

    /// Check the ordering `min <= p95 <= p99 <= max`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.min > self.max {
            return Err(ValidationError::LatencyRange {
                min: self.min,
                max: self.max,
            });
        }
        if let Some(p95) = self.p95 {
            if p95 < self.min || p95 > self.max {
                return Err(ValidationError::P95OutOfRange {
                    p95,
                    min: self.min,
                    max: self.max,
                });
            }
        }
        if let Some(p99) = self.p99 {
            let low = self.p95.map_or(self.min, |p95| p95.max(self.min));
            if p99 < low || p99 > self.max {
                return Err(ValidationError::P99OutOfRange {
                    p99,
                    low,
                    max: self.max,
                });
            }
        }
        Ok(())
    }

    /// Draw a delay in milliseconds.
    ///
    /// One percent of draws is reserved for `[p99, max]` and a further slice
    /// up to five percent for `[p95, p99-or-max]`, each only when the
    /// corresponding percentile is set. Everything else lands uniformly in
    /// `[min, p95-or-p99-or-max]`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        let roll = rng.gen_range(0..100u32);
        let (low, high) = match (self.p95, self.p99) {
            (_, Some(p99)) if roll < P99_TAIL_PERCENT => (p99, self.max),
            (Some(p95), p99) if roll < P95_TAIL_PERCENT => (p95, p99.unwrap_or(self.max)),
            (p95, p99) => (self.min, p95.or(p99).unwrap_or(self.max)),
        };
        if high > low {
            rng.gen_range(low..=high)
        } else {
            low
        }
    }

    /// Draw a delay as a [`Duration`].
    pub fn sample_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Duration::from_millis(self.sample(rng))
    }
}

/// One injectable error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ErrorConfig {
    /// Probability of firing, in percent
    pub percentage: f64,

    /// Latency applied instead of the host/URI rule when this error fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyConfig>,
}

impl ErrorConfig {
    pub fn new(percentage: f64) -> Self {
        Self {
            percentage,
            latency: None,
        }
    }
}

/// An error rule that fired, with its parsed status code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiredError {
    pub status: u16,
    pub rule: ErrorConfig,
}

/// Draw an integer in `[0, 100]` and walk the rules accumulating their
/// percentages; the first rule whose running sum reaches the draw fires.
///
/// Iteration order over the map is unspecified, so which of several rules
/// fires for a given draw is too. Only the overall fire rate is meaningful.
pub fn pick_error<R: Rng + ?Sized>(rules: &ErrorRules, rng: &mut R) -> Option<FiredError> {
    if rules.is_empty() {
        return None;
    }
    let draw = f64::from(rng.gen_range(0..=100u32));
    let mut cumulative = 0.0;
    for (code, rule) in rules {
        cumulative += rule.percentage;
        if cumulative >= draw {
            let status = code.parse().ok()?;
            return Some(FiredError { status, rule: *rule });
        }
    }
    None
}

/// Check status codes, percentages and nested latency rules of an error map.
pub fn validate_errors(rules: &ErrorRules) -> Result<(), ValidationError> {
    let mut sum = 0.0;
    for (code, rule) in rules {
        match code.parse::<u16>() {
            Ok(status) if (400..=599).contains(&status) => {}
            _ => return Err(ValidationError::InvalidStatusCode(code.clone())),
        }
        if !rule.percentage.is_finite() || rule.percentage <= 0.0 || rule.percentage > 100.0 {
            return Err(ValidationError::InvalidPercentage {
                code: code.clone(),
                percentage: rule.percentage,
            });
        }
        if let Some(latency) = &rule.latency {
            latency.validate().map_err(|e| e.at(code.as_str()))?;
        }
        sum += rule.percentage;
    }
    if sum > 100.0 + PERCENT_EPSILON {
        return Err(ValidationError::PercentageSum(sum));
    }
    Ok(())
}

/// Check a URI override. It must declare latency or errors.
pub fn validate_uri(uri: &str, config: &UriConfig) -> Result<(), ValidationError> {
    if !is_valid_uri(uri) {
        return Err(ValidationError::InvalidUri(uri.to_string()));
    }
    if config.latency.is_none() && config.errors.is_empty() {
        return Err(ValidationError::EmptyUriRule(uri.to_string()));
    }
    if let Some(latency) = &config.latency {
        latency.validate().map_err(|e| e.at(uri))?;
    }
    validate_errors(&config.errors).map_err(|e| e.at(uri))
}

/// Check a host name and everything underneath it.
pub fn validate_host(name: &str, config: &HostConfig) -> Result<(), ValidationError> {
    if !is_valid_host(name) {
        return Err(ValidationError::InvalidHost(name.to_string()));
    }
    let inner = || -> Result<(), ValidationError> {
        if let Some(latency) = &config.latency {
            latency.validate()?;
        }
        validate_errors(&config.errors)?;
        for (uri, uri_config) in &config.uris {
            validate_uri(uri, uri_config)?;
        }
        Ok(())
    };
    inner().map_err(|e| e.at(name))
}

fn host_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[A-Za-z0-9_](?:[A-Za-z0-9_-]{0,61}[A-Za-z0-9_])?(?:\.[A-Za-z0-9_](?:[A-Za-z0-9_-]{0,61}[A-Za-z0-9_])?)*(?::[0-9]{1,5})?$",
        )
        .expect("host grammar is a valid regex")
    })
}

fn ip_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(?:[0-9]{1,3}\.){3}[0-9]{1,3}|\[[0-9A-Fa-f:.]+\])(?::[0-9]{1,5})?$")
            .expect("ip grammar is a valid regex")
    })
}

fn uri_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/[A-Za-z0-9\-._~!$&'()*+,;=:@%/]*(?:\?[A-Za-z0-9\-._~!$&'()*+,;=:@%?]*)?$")
            .expect("uri grammar is a valid regex")
    })
}

/// Host names: dot-separated labels with an optional port.
pub fn is_valid_host(host: &str) -> bool {
    host_regex().is_match(host)
}

/// Raw IPv4 or bracketed IPv6 addresses, with an optional port.
pub fn is_ip_host(host: &str) -> bool {
    ip_regex().is_match(host)
}

/// HTTP methods: ASCII letters only.
pub fn is_valid_method(method: &str) -> bool {
    !method.is_empty() && method.bytes().all(|b| b.is_ascii_alphabetic())
}

/// Absolute URIs whose path segments are usable as directory names.
///
/// Empty, `.` and `..` segments are rejected, and so is a bare trailing
/// `root` segment since that leaf name is reserved for `/`.
pub fn is_valid_uri(uri: &str) -> bool {
    if !uri_regex().is_match(uri) {
        return false;
    }
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (uri, None),
    };
    let segments: Vec<&str> = path[1..].split('/').collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        if *segment == "." || *segment == ".." {
            return false;
        }
        if segment.is_empty() && i != last {
            return false;
        }
    }
    !(query.is_none() && segments[last] == "root")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parse_host_tree() {
        let yaml = r#"
settings:
  default_content_type: text/plain
  disable_cache: true
hosts:
  example.com:
    latency:
      min: 10
      p95: 50
      max: 100
    errors:
      "500":
        percentage: 10
        latency:
          min: 1000
          max: 2000
    uris:
      /api/users:
        errors:
          "503":
            percentage: 25
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert!(config.settings.disable_cache);
        assert_eq!(config.settings.default_content_type, "text/plain");

        let host = &config.hosts["example.com"];
        assert_eq!(host.latency.unwrap().p95, Some(50));
        assert_eq!(host.errors["500"].latency, Some(LatencyConfig::range(1000, 2000)));
        assert_eq!(host.uris["/api/users"].errors["503"].percentage, 25.0);
    }

    #[test]
    fn test_default_settings() {
        let config: ServerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.settings.default_content_type, "application/json");
        assert!(!config.settings.disable_latency);
        assert!(config.hosts.is_empty());
    }

    #[test]
    fn test_latency_requires_min_and_max() {
        let result: Result<LatencyConfig, _> = serde_json::from_str(r#"{"min": 10}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_latency_validation() {
        assert!(LatencyConfig::range(10, 20).validate().is_ok());
        assert_eq!(
            LatencyConfig::range(30, 20).validate(),
            Err(ValidationError::LatencyRange { min: 30, max: 20 })
        );

        let p95_high = LatencyConfig {
            min: 10,
            p95: Some(25),
            p99: None,
            max: 20,
        };
        assert!(matches!(
            p95_high.validate(),
            Err(ValidationError::P95OutOfRange { .. })
        ));

        let p99_below_p95 = LatencyConfig {
            min: 10,
            p95: Some(18),
            p99: Some(15),
            max: 20,
        };
        assert!(matches!(
            p99_below_p95.validate(),
            Err(ValidationError::P99OutOfRange { low: 18, .. })
        ));

        let full = LatencyConfig {
            min: 10,
            p95: Some(15),
            p99: Some(18),
            max: 20,
        };
        assert!(full.validate().is_ok());
    }

    #[test]
    fn test_percentage_sum_rejected() {
        let rules: ErrorRules =
            serde_json::from_str(r#"{"500":{"percentage":60},"503":{"percentage":50}}"#).unwrap();
        assert_eq!(validate_errors(&rules), Err(ValidationError::PercentageSum(110.0)));

        let host = HostConfig {
            errors: rules,
            ..Default::default()
        };
        let err = validate_host("example.com", &host).unwrap_err();
        assert_eq!(err.root(), &ValidationError::PercentageSum(110.0));
    }

    #[test]
    fn test_status_code_and_percentage_validation() {
        let mut rules = ErrorRules::new();
        rules.insert("200".to_string(), ErrorConfig::new(10.0));
        assert_eq!(
            validate_errors(&rules),
            Err(ValidationError::InvalidStatusCode("200".to_string()))
        );

        let mut rules = ErrorRules::new();
        rules.insert("abc".to_string(), ErrorConfig::new(10.0));
        assert!(validate_errors(&rules).is_err());

        let mut rules = ErrorRules::new();
        rules.insert("500".to_string(), ErrorConfig::new(0.0));
        assert!(matches!(
            validate_errors(&rules),
            Err(ValidationError::InvalidPercentage { .. })
        ));

        let mut rules = ErrorRules::new();
        rules.insert("599".to_string(), ErrorConfig::new(100.0));
        assert!(validate_errors(&rules).is_ok());
    }

    #[test]
    fn test_empty_uri_rule_rejected() {
        assert_eq!(
            validate_uri("/api", &UriConfig::default()),
            Err(ValidationError::EmptyUriRule("/api".to_string()))
        );
    }

    #[test]
    fn test_host_grammar() {
        assert!(is_valid_host("example.com"));
        assert!(is_valid_host("localhost:8080"));
        assert!(is_valid_host("api-v2.internal_svc.local"));
        assert!(!is_valid_host(""));
        assert!(!is_valid_host("-bad.com"));
        assert!(!is_valid_host("bad/host"));

        assert!(is_ip_host("127.0.0.1"));
        assert!(is_ip_host("10.0.0.2:8080"));
        assert!(is_ip_host("[::1]:8080"));
        assert!(!is_ip_host("example.com"));
    }

    #[test]
    fn test_uri_grammar() {
        assert!(is_valid_uri("/"));
        assert!(is_valid_uri("/api/users"));
        assert!(is_valid_uri("/api/users/"));
        assert!(is_valid_uri("/api/users?page=1&size=10"));
        assert!(is_valid_uri("/root?x=1"));
        assert!(!is_valid_uri("api/users"));
        assert!(!is_valid_uri("/api//users"));
        assert!(!is_valid_uri("/api/../etc"));
        assert!(!is_valid_uri("/api/root"));
        assert!(!is_valid_uri("/api?next=/home"));
        assert!(!is_valid_uri("/with space"));
    }

    #[test]
    fn test_uniform_latency_within_bounds() {
        let rule = LatencyConfig::range(10, 20);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let delay = rule.sample(&mut rng);
            assert!((10..=20).contains(&delay));
        }
    }

    #[test]
    fn test_p95_tail_is_reserved() {
        let rule = LatencyConfig {
            min: 10,
            p95: Some(50),
            p99: None,
            max: 100,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let draws = 10_000;
        let mut tail = 0;
        for _ in 0..draws {
            let delay = rule.sample(&mut rng);
            assert!((10..=100).contains(&delay));
            if delay > 50 {
                tail += 1;
            }
        }
        assert!(tail > 0);
        assert!(tail as f64 / draws as f64 <= 0.065, "tail share {}", tail);
    }

    #[test]
    fn test_p99_tail_is_reserved() {
        let rule = LatencyConfig {
            min: 0,
            p95: Some(100),
            p99: Some(200),
            max: 1000,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let draws = 10_000;
        let above_p99 = (0..draws)
            .map(|_| rule.sample(&mut rng))
            .filter(|delay| *delay > 200)
            .count();
        assert!(above_p99 as f64 / draws as f64 <= 0.02);
    }

    #[test]
    fn test_degenerate_latency() {
        let rule = LatencyConfig::range(25, 25);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(rule.sample(&mut rng), 25);
    }

    #[test]
    fn test_error_fire_rate_converges() {
        let mut rules = ErrorRules::new();
        rules.insert("500".to_string(), ErrorConfig::new(20.0));
        rules.insert("503".to_string(), ErrorConfig::new(30.0));

        let mut rng = StdRng::seed_from_u64(11);
        let draws = 10_000;
        let mut fired = 0;
        for _ in 0..draws {
            if let Some(hit) = pick_error(&rules, &mut rng) {
                assert!(hit.status == 500 || hit.status == 503);
                fired += 1;
            }
        }
        let rate = fired as f64 * 100.0 / draws as f64;
        assert!((rate - 50.0).abs() <= 2.0, "observed rate {}", rate);
    }

    #[test]
    fn test_full_percentage_always_fires() {
        let mut rules = ErrorRules::new();
        rules.insert("502".to_string(), ErrorConfig::new(100.0));
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..1_000 {
            assert_eq!(pick_error(&rules, &mut rng).map(|f| f.status), Some(502));
        }
        assert!(pick_error(&ErrorRules::new(), &mut rng).is_none());
    }
}
