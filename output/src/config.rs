//! Environment configuration
//!
//! Every setting has a default and can be overridden by a `TOIMITUS_*`
//! variable. [`Config::from_env`] reads them through the `config` crate,
//! converts units and validates in one go.

use crate::backoff::{Backoff, BackoffKind};
use crate::error::ConfigError;
use crate::protocol::ClientConfig;
use crate::stall::StallPolicy;
use ::config::{Environment, Map};
use serde::Deserialize;
use serde::de::{self, Deserializer, Visitor};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "TOIMITUS";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Sink addresses (`host:port`)
    pub hosts: Vec<String>,
    /// One client worker per host instead of a failover group
    pub loadbalance: bool,

    // Batching
    pub queue_hwm: usize,
    pub bulk_max_size: usize,
    pub flush_interval: Duration,

    // Windowed client
    pub slow_start: bool,
    pub window_start: usize,
    pub compression_level: u32,
    pub timeout: Duration,
    pub max_consecutive_timeouts: u32,
    pub ttl: Option<Duration>,
    pub connect_timeout: Duration,
    pub stall_timeout: Duration,
    pub stall_policy: StallPolicy,

    // Retry
    pub backoff_init: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: bool,
    /// `None` retries forever
    pub max_retries: Option<u32>,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost:5044".to_string()],
            loadbalance: false,
            queue_hwm: 4096,
            bulk_max_size: 2048,
            flush_interval: Duration::from_millis(1000),
            slow_start: true,
            window_start: 10,
            compression_level: 3,
            timeout: Duration::from_secs(30),
            max_consecutive_timeouts: 3,
            ttl: None,
            connect_timeout: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(300),
            stall_policy: StallPolicy::AlertOnly,
            backoff_init: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(60_000),
            backoff_jitter: true,
            max_retries: Some(3),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load from `TOIMITUS_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Environment::with_prefix(ENV_PREFIX))
    }

    /// Load from the given `TOIMITUS_*` variables instead of the process
    /// environment
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let source: Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::load(Environment::with_prefix(ENV_PREFIX).source(Some(source)))
    }

    fn load(env: Environment) -> Result<Self, ConfigError> {
        let raw: RawConfig = ::config::Config::builder()
            .set_default("hosts", vec!["localhost:5044"])?
            .set_default("loadbalance", false)?
            .set_default("queue_hwm", 4096)?
            .set_default("bulk_max_size", 2048)?
            .set_default("flush_interval_ms", 1000)?
            .set_default("slow_start", true)?
            .set_default("window_start", 10)?
            .set_default("compression_level", 3)?
            .set_default("timeout_secs", 30)?
            .set_default("max_consecutive_timeouts", 3)?
            .set_default("ttl_secs", 0)?
            .set_default("connect_timeout_secs", 10)?
            .set_default("stall_timeout_secs", 300)?
            .set_default("stall_policy", "alert")?
            .set_default("backoff_init_ms", 1000)?
            .set_default("backoff_max_ms", 60_000)?
            .set_default("backoff_jitter", true)?
            .set_default("max_retries", 3)?
            .set_default("log_level", "info")?
            .set_default("log_format", "pretty")?
            .add_source(env.try_parsing(true).ignore_empty(true))
            .build()?
            .try_deserialize()?;

        let config = Self::try_from(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check bounds and cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Constraint(msg.to_string()));

        if self.hosts.is_empty() {
            return fail("at least one host is required");
        }
        if self.queue_hwm == 0 {
            return fail("queue_hwm must be greater than 0");
        }
        if self.bulk_max_size == 0 {
            return fail("bulk_max_size must be greater than 0");
        }
        if self.window_start == 0 {
            return fail("window_start must be greater than 0");
        }
        if self.window_start > self.bulk_max_size {
            return Err(ConfigError::Constraint(format!(
                "window_start ({}) exceeds bulk_max_size ({})",
                self.window_start, self.bulk_max_size
            )));
        }
        if self.compression_level > 9 {
            return Err(ConfigError::Constraint(format!(
                "compression_level {} out of range 0-9",
                self.compression_level
            )));
        }
        if self.backoff_init > self.backoff_max {
            return fail("backoff_init must not exceed backoff_max");
        }
        if self.timeout.is_zero() {
            return fail("timeout must be greater than 0");
        }
        if self.max_consecutive_timeouts == 0 {
            return fail("max_consecutive_timeouts must be greater than 0");
        }
        Ok(())
    }

    /// Settings for each windowed client
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: self.timeout,
            max_consecutive_timeouts: self.max_consecutive_timeouts,
            compression_level: self.compression_level,
            slow_start: self.slow_start,
            window_start: self.window_start,
            max_window: self.bulk_max_size,
            ttl: self.ttl,
            stall_timeout: self.stall_timeout,
            stall_policy: self.stall_policy,
        }
    }

    /// A fresh backoff schedule
    pub fn backoff(&self) -> Backoff {
        let kind = if self.backoff_jitter {
            BackoffKind::EqualJitter
        } else {
            BackoffKind::Exponential
        };
        Backoff::new(kind, self.backoff_init, self.backoff_max)
    }
}

/// Settings as read from the environment, before unit conversion
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(deserialize_with = "deserialize_hosts")]
    hosts: Vec<String>,
    loadbalance: bool,
    queue_hwm: usize,
    bulk_max_size: usize,
    flush_interval_ms: u64,
    slow_start: bool,
    window_start: usize,
    compression_level: u32,
    timeout_secs: u64,
    max_consecutive_timeouts: u32,
    ttl_secs: u64,
    connect_timeout_secs: u64,
    stall_timeout_secs: u64,
    stall_policy: String,
    backoff_init_ms: u64,
    backoff_max_ms: u64,
    backoff_jitter: bool,
    max_retries: i64,
    log_level: String,
    log_format: String,
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let stall_policy = raw
            .stall_policy
            .parse()
            .map_err(|e| invalid("TOIMITUS_STALL_POLICY", &raw.stall_policy, e))?;
        let log_format = raw
            .log_format
            .parse()
            .map_err(|e| invalid("TOIMITUS_LOG_FORMAT", &raw.log_format, e))?;
        // negative means unlimited
        let max_retries = match raw.max_retries {
            n if n < 0 => None,
            n => Some(u32::try_from(n).map_err(|e| invalid("TOIMITUS_MAX_RETRIES", n, e))?),
        };

        Ok(Self {
            hosts: raw.hosts,
            loadbalance: raw.loadbalance,
            queue_hwm: raw.queue_hwm,
            bulk_max_size: raw.bulk_max_size,
            flush_interval: Duration::from_millis(raw.flush_interval_ms),
            slow_start: raw.slow_start,
            window_start: raw.window_start,
            compression_level: raw.compression_level,
            timeout: Duration::from_secs(raw.timeout_secs),
            max_consecutive_timeouts: raw.max_consecutive_timeouts,
            ttl: (raw.ttl_secs > 0).then(|| Duration::from_secs(raw.ttl_secs)),
            connect_timeout: Duration::from_secs(raw.connect_timeout_secs),
            stall_timeout: Duration::from_secs(raw.stall_timeout_secs),
            stall_policy,
            backoff_init: Duration::from_millis(raw.backoff_init_ms),
            backoff_max: Duration::from_millis(raw.backoff_max_ms),
            backoff_jitter: raw.backoff_jitter,
            max_retries,
            log_level: raw.log_level,
            log_format,
        })
    }
}

fn invalid(key: &'static str, value: impl ToString, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Comma separated string from the environment, or a list from defaults
fn deserialize_hosts<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct HostsVisitor;

    impl<'de> Visitor<'de> for HostsVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a comma separated string or a sequence of host:port")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect())
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut hosts = Vec::new();
            while let Some(host) = seq.next_element()? {
                hosts.push(host);
            }
            Ok(hosts)
        }
    }

    deserializer.deserialize_any(HostsVisitor)
}
