use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::error::DEFAULT_RETRYABLE_STATUSES;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the client.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "jobhub".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Per-request deadlines, tiered by how slow an endpoint is known to be.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    /// Quick reads of critical data.
    #[serde(with = "humantime_serde")]
    pub fast: Duration,
    /// Everything without a more specific tier.
    #[serde(with = "humantime_serde")]
    pub default: Duration,
    /// Endpoints backed by slow database queries.
    #[serde(with = "humantime_serde")]
    pub database: Duration,
    /// Heavy operations, like AI completions.
    #[serde(with = "humantime_serde")]
    pub slow: Duration,
    /// File uploads.
    #[serde(with = "humantime_serde")]
    pub upload: Duration,
    /// The timeout for establishing a connection.
    ///
    /// This applies to each individual attempt if retries take place.
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(15),
            // Raised for slow database connections on the backend.
            default: Duration::from_secs(45),
            database: Duration::from_secs(60),
            slow: Duration::from_secs(90),
            upload: Duration::from_secs(3 * 60),
            connect: Duration::from_secs(5),
        }
    }
}

/// A named request deadline, see [`Timeouts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutTier {
    Fast,
    Default,
    Database,
    Slow,
    Upload,
}

impl Timeouts {
    pub fn get(&self, tier: TimeoutTier) -> Duration {
        match tier {
            TimeoutTier::Fast => self.fast,
            TimeoutTier::Default => self.default,
            TimeoutTier::Database => self.database,
            TimeoutTier::Slow => self.slow,
            TimeoutTier::Upload => self.upload,
        }
    }
}

/// Time-to-live of cached responses, tiered by data volatility.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheTtls {
    /// List data that changes often.
    #[serde(with = "humantime_serde")]
    pub short: Duration,
    #[serde(with = "humantime_serde")]
    pub default: Duration,
    #[serde(with = "humantime_serde")]
    pub long: Duration,
    /// AI-derived content, which is expensive to produce.
    #[serde(with = "humantime_serde")]
    pub ai_results: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(30),
            default: Duration::from_secs(60),
            long: Duration::from_secs(5 * 60),
            ai_results: Duration::from_secs(10 * 60),
        }
    }
}

/// A named time-to-live, see [`CacheTtls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlTier {
    Short,
    Default,
    Long,
    AiResults,
}

impl CacheTtls {
    pub fn get(&self, tier: TtlTier) -> Duration {
        match tier {
            TtlTier::Short => self.short,
            TtlTier::Default => self.default,
            TtlTier::Long => self.long,
            TtlTier::AiResults => self.ai_results,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live tiers.
    pub ttl: CacheTtls,

    /// Maximum number of entries kept in the in-memory response cache.
    ///
    /// Defaults to `10_000`.
    pub in_memory_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: CacheTtls::default(),
            in_memory_capacity: 10_000,
        }
    }
}

/// Bounded retries with exponential backoff.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: u32,
    /// The delay before the first retry, doubled for every following one.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Status codes that are considered transient.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }
}

/// Policy of the circuit breaker guarding degradable dependencies.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures after which the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open after the last failure.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DegradableConfig {
    /// The maximum number of simultaneous calls to one degradable dependency.
    ///
    /// Calls above this limit are rejected right away.
    pub max_concurrent_requests: usize,
}

impl Default for DegradableConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 2,
        }
    }
}

/// Thresholds after which a running operation is reported as slow.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SlowOperationConfig {
    #[serde(with = "humantime_serde")]
    pub warning_threshold: Duration,
    #[serde(with = "humantime_serde")]
    pub error_threshold: Duration,
}

impl Default for SlowOperationConfig {
    fn default() -> Self {
        Self {
            warning_threshold: Duration::from_secs(5),
            error_threshold: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Features {
    /// Serve repeated reads from the in-memory cache.
    pub enable_caching: bool,
    /// Coalesce concurrent identical reads into one backend call.
    pub enable_request_dedup: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            enable_caching: true,
            enable_request_dedup: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The base URL all request paths are joined to.
    pub base_url: String,

    /// Bearer token sent with every request.
    pub auth_token: Option<String>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<String>,

    pub timeouts: Timeouts,

    pub cache: CacheConfig,

    pub retry: RetryConfig,

    pub circuit_breaker: CircuitBreakerConfig,

    pub degradable: DegradableConfig,

    pub slow_operations: SlowOperationConfig,

    pub features: Features,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: "http://localhost:8000/api/v1".to_owned(),
            auth_token: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            timeouts: Timeouts::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            degradable: DegradableConfig::default(),
            slow_operations: SlowOperationConfig::default(),
            features: Features::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
