use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub locking: LockConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL for locks, trigger indices and queues
    pub redis_url: String,
    /// Key prefix so several deployments can share one store
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "posguard".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// TTL for the exclusive lock key in seconds
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval between turn-queue rank polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum rank polls before the acquisition gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_lock_ttl_secs() -> u64 {
    90
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    120
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Tolerance for the limit-order recheck heuristic, as a fraction of the
    /// order price (0.0015 = 0.15%). The recheck fires when the favorable
    /// extreme price since the last check crosses the order price widened by
    /// this margin. Polling bound only, never a correctness gate.
    #[serde(default = "default_recheck_tolerance")]
    pub recheck_tolerance_pct: Decimal,
    /// Recheck a limit order regardless of price once it has not been
    /// checked for this many seconds
    #[serde(default = "default_recheck_max_age_secs")]
    pub recheck_max_age_secs: u64,
    /// Transient exchange errors tolerated per order before the order is
    /// resolved as errored
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    /// Re-fetch attempts when summed trade fills mismatch the reported fill
    #[serde(default = "default_fill_refetch_attempts")]
    pub fill_refetch_attempts: u32,
}

fn default_recheck_tolerance() -> Decimal {
    use rust_decimal_macros::dec;
    dec!(0.0015)
}

fn default_recheck_max_age_secs() -> u64 {
    300
}

fn default_max_transient_retries() -> u32 {
    10
}

fn default_fill_refetch_attempts() -> u32 {
    2
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            recheck_tolerance_pct: default_recheck_tolerance(),
            recheck_max_age_secs: default_recheck_max_age_secs(),
            max_transient_retries: default_max_transient_retries(),
            fill_refetch_attempts: default_fill_refetch_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    /// Total market-close submission attempts (first try included)
    #[serde(default = "default_exit_max_attempts")]
    pub max_attempts: u32,
}

fn default_exit_max_attempts() -> u32 {
    4
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_exit_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Process name used in lock owner tokens and turn-queue entries
    pub process_name: String,
    /// Queues this worker consumes, in priority order
    pub queues: Vec<String>,
    /// Blocking-consume timeout in seconds
    #[serde(default = "default_consume_timeout_secs")]
    pub consume_timeout_secs: u64,
    /// Redeliveries tolerated before a message is dropped with an error log
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

fn default_consume_timeout_secs() -> u64 {
    5
}

fn default_max_redeliveries() -> u32 {
    20
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("store.namespace", default_namespace())?
            .set_default("worker.consume_timeout_secs", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("POSGUARD_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (POSGUARD_STORE__REDIS_URL, etc.)
            .add_source(
                Environment::with_prefix("POSGUARD")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.locking.ttl_secs == 0 {
            errors.push("locking.ttl_secs must be positive".to_string());
        }

        if self.locking.poll_interval_ms == 0 {
            errors.push("locking.poll_interval_ms must be positive".to_string());
        }

        // A waiter must be able to outlive a crashed holder's TTL, otherwise
        // liveness under crash does not hold.
        let poll_window_ms = self.locking.poll_interval_ms * self.locking.max_attempts as u64;
        if poll_window_ms < self.locking.ttl_secs * 1_000 {
            errors.push(format!(
                "lock poll window ({poll_window_ms}ms) is shorter than the lock TTL; \
                 waiters would give up before a crashed holder expires"
            ));
        }

        if self.monitor.recheck_tolerance_pct < Decimal::ZERO {
            errors.push("monitor.recheck_tolerance_pct must not be negative".to_string());
        }

        if self.exit.max_attempts == 0 {
            errors.push("exit.max_attempts must be positive".to_string());
        }

        if self.worker.process_name.trim().is_empty() {
            errors.push("worker.process_name must not be empty".to_string());
        }

        if self.worker.queues.is_empty() {
            errors.push("worker.queues must name at least one queue".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
