//! Configuration for the datum collector.
//!
//! [`CollectorOptions`] holds the tuning knobs of the collector itself and
//! [`Config`] adds the service-level settings used by the binary. Both load
//! from `DATUM_COLLECTOR_*` environment variables, falling back to defaults.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::DEFAULT_VISIBILITY_TIMEOUT;

const ENV_PREFIX: &str = "DATUM_COLLECTOR_";

/// Upper bound for either worker pool.
const MAX_CONCURRENCY: usize = 64;

/// Upper bound for the work queue, to keep memory use predictable.
const MAX_WORK_QUEUE_CAPACITY: usize = 1_000_000;

/// Upper bound for one receive call.
const MAX_READ_MESSAGE_COUNT: usize = 100;

/// Tuning options for a [`DatumCollector`](crate::collector::DatumCollector).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorOptions {
    /// Number of writer tasks draining the work queue
    pub write_concurrency: usize,

    /// Number of reader tasks polling the durable queue; zero disables reading
    pub read_concurrency: usize,

    /// Longest a writer waits on the backing store before overflowing
    pub work_item_max_wait: Duration,

    /// Capacity of the in-process work queue
    pub work_queue_capacity: usize,

    /// Default drain deadline for `shutdown_and_wait`
    pub shutdown_wait: Duration,

    /// Maximum messages requested per receive
    pub read_max_message_count: usize,

    /// Increment of the reader backoff sleep
    pub read_sleep_throttle_step: Duration,

    /// Ceiling of the reader backoff sleep
    pub read_sleep_max: Duration,

    /// Long-poll wait passed to the durable queue
    pub read_wait: Duration,

    /// Longest `store` or a reader waits for room in the work queue
    pub offer_timeout: Duration,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            write_concurrency: 2,
            read_concurrency: 0,
            work_item_max_wait: Duration::from_millis(1000),
            work_queue_capacity: 1000,
            shutdown_wait: Duration::from_secs(30),
            read_max_message_count: 10,
            read_sleep_throttle_step: Duration::from_millis(1000),
            read_sleep_max: Duration::from_millis(15_000),
            read_wait: Duration::from_secs(10),
            offer_timeout: Duration::from_millis(50),
        }
    }
}

impl CollectorOptions {
    /// Load options from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is not a valid number or the
    /// resulting options fail [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let options = Self {
            write_concurrency: parse_var("WRITE_CONCURRENCY", defaults.write_concurrency)?,
            read_concurrency: parse_var("READ_CONCURRENCY", defaults.read_concurrency)?,
            work_item_max_wait: parse_millis("WORK_ITEM_MAX_WAIT_MS", defaults.work_item_max_wait)?,
            work_queue_capacity: parse_var("WORK_QUEUE_CAPACITY", defaults.work_queue_capacity)?,
            shutdown_wait: parse_secs("SHUTDOWN_WAIT_SECS", defaults.shutdown_wait)?,
            read_max_message_count: parse_var(
                "READ_MAX_MESSAGE_COUNT",
                defaults.read_max_message_count,
            )?,
            read_sleep_throttle_step: parse_millis(
                "READ_SLEEP_THROTTLE_STEP_MS",
                defaults.read_sleep_throttle_step,
            )?,
            read_sleep_max: parse_millis("READ_SLEEP_MAX_MS", defaults.read_sleep_max)?,
            read_wait: parse_secs("READ_WAIT_SECS", defaults.read_wait)?,
            offer_timeout: parse_millis("OFFER_TIMEOUT_MS", defaults.offer_timeout)?,
        };

        options.validate()?;
        Ok(options)
    }

    /// Check option ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_concurrency == 0 || self.write_concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::for_var(
                "WRITE_CONCURRENCY",
                format!(
                    "write concurrency {} must be between 1 and {}",
                    self.write_concurrency, MAX_CONCURRENCY
                ),
            ));
        }

        if self.read_concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::for_var(
                "READ_CONCURRENCY",
                format!(
                    "read concurrency {} exceeds maximum ({})",
                    self.read_concurrency, MAX_CONCURRENCY
                ),
            ));
        }

        if self.work_item_max_wait.is_zero() {
            return Err(ConfigError::for_var(
                "WORK_ITEM_MAX_WAIT_MS",
                "work item max wait must be greater than 0".to_string(),
            ));
        }

        if self.work_queue_capacity == 0 || self.work_queue_capacity > MAX_WORK_QUEUE_CAPACITY {
            return Err(ConfigError::for_var(
                "WORK_QUEUE_CAPACITY",
                format!(
                    "work queue capacity {} must be between 1 and {}",
                    self.work_queue_capacity, MAX_WORK_QUEUE_CAPACITY
                ),
            ));
        }

        if self.read_max_message_count == 0 || self.read_max_message_count > MAX_READ_MESSAGE_COUNT
        {
            return Err(ConfigError::for_var(
                "READ_MAX_MESSAGE_COUNT",
                format!(
                    "read max message count {} must be between 1 and {}",
                    self.read_max_message_count, MAX_READ_MESSAGE_COUNT
                ),
            ));
        }

        if self.read_sleep_throttle_step.is_zero() {
            return Err(ConfigError::for_var(
                "READ_SLEEP_THROTTLE_STEP_MS",
                "read sleep throttle step must be greater than 0".to_string(),
            ));
        }

        if self.read_sleep_max < self.read_sleep_throttle_step {
            return Err(ConfigError::for_var(
                "READ_SLEEP_MAX_MS",
                format!(
                    "read sleep max {}ms is below the throttle step ({}ms)",
                    self.read_sleep_max.as_millis(),
                    self.read_sleep_throttle_step.as_millis()
                ),
            ));
        }

        Ok(())
    }
}

/// Configuration for the datum collector service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Collector tuning options
    pub options: CollectorOptions,

    /// Base URL of a remote durable queue; selects the HTTP queue when set
    pub queue_url: Option<String>,

    /// Spool directory; selects the disk queue when set and no URL is given
    pub spool_dir: Option<PathBuf>,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Maximum number of retry attempts for queue sends and deletes
    pub max_retries: u32,

    /// Visibility timeout for the local queues
    pub visibility_timeout: Duration,

    /// Interval between simulated readings
    pub producer_interval: Duration,

    /// Simulated backing store latency
    pub sim_store_latency: Duration,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(suffix: &str, message: String) -> Self {
        Self {
            message,
            env_var: Some(format!("{}{}", ENV_PREFIX, suffix)),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any numeric variable fails to parse or the
    /// collector options are out of range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use datum_collector::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Writers: {}", config.options.write_concurrency);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let queue_url = env::var(format!("{}QUEUE_URL", ENV_PREFIX))
            .ok()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        let spool_dir = env::var(format!("{}SPOOL_DIR", ENV_PREFIX))
            .ok()
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);

        let producer_interval =
            parse_millis("PRODUCER_INTERVAL_MS", defaults.producer_interval)?;
        if producer_interval.is_zero() {
            return Err(ConfigError::for_var(
                "PRODUCER_INTERVAL_MS",
                "must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            options: CollectorOptions::from_env()?,
            queue_url,
            spool_dir,
            request_timeout: parse_secs("REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            max_retries: parse_var("MAX_RETRIES", defaults.max_retries)?,
            visibility_timeout: parse_secs(
                "VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout,
            )?,
            producer_interval,
            sim_store_latency: parse_millis("SIM_STORE_LATENCY_MS", defaults.sim_store_latency)?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            options: CollectorOptions::default(),
            queue_url: None,
            spool_dir: None,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            producer_interval: Duration::from_millis(50),
            sim_store_latency: Duration::ZERO,
        }
    }
}

/// Parse `DATUM_COLLECTOR_{suffix}`, or return `default` when unset.
fn parse_var<T: FromStr>(suffix: &str, default: T) -> Result<T, ConfigError> {
    match env::var(format!("{}{}", ENV_PREFIX, suffix)) {
        Ok(value) => value.trim().parse().map_err(|_| {
            ConfigError::for_var(suffix, format!("'{}' is not a valid number", value))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_millis(suffix: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(suffix, default.as_millis() as u64).map(Duration::from_millis)
}

fn parse_secs(suffix: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(suffix, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-wide; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(suffix: &str, value: &str) -> Self {
            let key = format!("{}{}", ENV_PREFIX, suffix);
            let original = env::var(&key).ok();
            env::set_var(&key, value);
            Self { key, original }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn test_default_options() {
        let options = CollectorOptions::default();
        assert_eq!(options.write_concurrency, 2);
        assert_eq!(options.read_concurrency, 0);
        assert_eq!(options.work_item_max_wait, Duration::from_millis(1000));
        assert_eq!(options.read_max_message_count, 10);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.queue_url.is_none());
        assert!(config.spool_dir.is_none());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.visibility_timeout, DEFAULT_VISIBILITY_TIMEOUT);
    }

    #[test]
    fn test_options_from_env_custom_values() {
        let _lock = lock_env();
        let _g1 = EnvGuard::set("WRITE_CONCURRENCY", "4");
        let _g2 = EnvGuard::set("READ_CONCURRENCY", "2");
        let _g3 = EnvGuard::set("WORK_ITEM_MAX_WAIT_MS", "200");
        let _g4 = EnvGuard::set("READ_SLEEP_MAX_MS", "5000");

        let options = CollectorOptions::from_env().expect("Should load custom values");
        assert_eq!(options.write_concurrency, 4);
        assert_eq!(options.read_concurrency, 2);
        assert_eq!(options.work_item_max_wait, Duration::from_millis(200));
        assert_eq!(options.read_sleep_max, Duration::from_millis(5000));
    }

    #[test]
    fn test_config_queue_url_trimmed() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("QUEUE_URL", "http://queue:9324/datum/");

        let config = Config::from_env().expect("Should load");
        assert_eq!(config.queue_url.as_deref(), Some("http://queue:9324/datum"));
    }

    #[test]
    fn test_zero_producer_interval_rejected() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("PRODUCER_INTERVAL_MS", "0");

        let err = Config::from_env().unwrap_err();
        assert_eq!(
            err.env_var.as_deref(),
            Some("DATUM_COLLECTOR_PRODUCER_INTERVAL_MS")
        );
    }

    #[test]
    fn test_invalid_number() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("WORK_QUEUE_CAPACITY", "lots");

        let err = CollectorOptions::from_env().unwrap_err();
        assert!(err.message.contains("not a valid number"));
        assert_eq!(
            err.env_var.as_deref(),
            Some("DATUM_COLLECTOR_WORK_QUEUE_CAPACITY")
        );
    }

    #[test]
    fn test_zero_write_concurrency_rejected() {
        let options = CollectorOptions {
            write_concurrency: 0,
            ..CollectorOptions::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.message.contains("between 1 and"));
    }

    #[test]
    fn test_sleep_max_below_step_rejected() {
        let options = CollectorOptions {
            read_sleep_throttle_step: Duration::from_millis(500),
            read_sleep_max: Duration::from_millis(100),
            ..CollectorOptions::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.message.contains("below the throttle step"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let options = CollectorOptions {
            work_queue_capacity: 0,
            ..CollectorOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
