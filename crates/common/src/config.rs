use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

// Default constants
pub const DEFAULT_POOL_SIZE: usize = 16;
pub const DEFAULT_STREAM_POOL_SIZE: usize = 750;
pub const DEFAULT_TRANSACTION_CAP: usize = 20;
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_TX_POOL_TIMEOUT_SECS: f64 = 1.0;
pub const DEFAULT_POOL_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_IDLE_TIMEOUT_SECS: f64 = 1800.0;
pub const DEFAULT_MAX_RESULT_SIZE: usize = 10000;
pub const DEFAULT_MAX_DML_ROWS: usize = 500;
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_QUERY_CACHE_SIZE: u64 = 5000;
pub const DEFAULT_SCHEMA_RELOAD_TIME_SECS: f64 = 1800.0;

pub const DEFAULT_ROW_CACHE_CAPACITY: u64 = 100_000;
pub const DEFAULT_ROW_CACHE_TIMEOUT_MS: u64 = 500;

pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_ENV_PREFIX: &str = "TABLET";

/// Query engine configuration.
///
/// Built once at startup and handed to the server by value; nothing in the
/// engine reads configuration from process-wide state.
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct TabletConfig {
    /// Connections in the non-transactional pool
    #[serde(default = "default_pool_size")]
    #[validate(range(min = 1))]
    pub pool_size: usize,

    /// Connections in the streaming pool
    #[serde(default = "default_stream_pool_size")]
    #[validate(range(min = 1))]
    pub stream_pool_size: usize,

    /// Maximum concurrent transactions
    #[serde(default = "default_transaction_cap")]
    #[validate(range(min = 1))]
    pub transaction_cap: usize,

    /// Transactions older than this are killed
    #[serde(default = "default_transaction_timeout")]
    #[validate(range(min = 0.0))]
    pub transaction_timeout_secs: f64,

    /// How long Begin waits for a transaction slot
    #[serde(default = "default_tx_pool_timeout")]
    #[validate(range(min = 0.0))]
    pub tx_pool_timeout_secs: f64,

    /// How long a statement waits for a pooled connection
    #[serde(default = "default_pool_timeout")]
    #[validate(range(min = 0.0))]
    pub pool_timeout_secs: f64,

    /// Idle pooled connections are closed after this long
    #[serde(default = "default_idle_timeout")]
    #[validate(range(min = 0.0))]
    pub idle_timeout_secs: f64,

    #[serde(default = "default_max_result_size")]
    #[validate(range(min = 1))]
    pub max_result_size: usize,

    #[serde(default = "default_max_dml_rows")]
    #[validate(range(min = 1))]
    pub max_dml_rows: usize,

    /// Byte budget of a single streamed chunk
    #[serde(default = "default_stream_buffer_size")]
    #[validate(range(min = 1))]
    pub stream_buffer_size: usize,

    /// Plan cache capacity
    #[serde(default = "default_query_cache_size")]
    #[validate(range(min = 1))]
    pub query_cache_size: u64,

    #[serde(default = "default_schema_reload_time")]
    #[validate(range(min = 0.0))]
    pub schema_reload_time_secs: f64,

    /// Zero disables the per-statement timeout
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub query_timeout_secs: f64,

    /// Reject DML that cannot be rewritten into a PK-scoped form
    #[serde(default = "default_true")]
    pub strict_mode: bool,

    #[serde(default)]
    pub strict_table_acl: bool,

    #[serde(default)]
    pub enable_table_acl_dry_run: bool,

    /// Identities that bypass table ACL checks
    #[serde(default)]
    pub table_acl_exempt_acl: Vec<String>,

    /// Hide bind variable values in errors and query logs
    #[serde(default)]
    pub terse_errors: bool,

    /// Wrap DML issued outside a transaction in an implicit one
    #[serde(default)]
    pub enable_autocommit: bool,

    #[serde(default)]
    #[validate(nested)]
    pub row_cache: RowCacheConfig,

    /// JSON rule list registered as the FILE_CUSTOM_RULE source
    #[serde(default)]
    pub query_rules_file: Option<String>,

    /// JSON or YAML table ACL configuration
    #[serde(default)]
    pub table_acl_file: Option<String>,

    /// Schema corrections applied on top of what the database reports
    #[serde(default)]
    pub schema_overrides: Vec<SchemaOverride>,
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            stream_pool_size: default_stream_pool_size(),
            transaction_cap: default_transaction_cap(),
            transaction_timeout_secs: default_transaction_timeout(),
            tx_pool_timeout_secs: default_tx_pool_timeout(),
            pool_timeout_secs: default_pool_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            max_result_size: default_max_result_size(),
            max_dml_rows: default_max_dml_rows(),
            stream_buffer_size: default_stream_buffer_size(),
            query_cache_size: default_query_cache_size(),
            schema_reload_time_secs: default_schema_reload_time(),
            query_timeout_secs: 0.0,
            strict_mode: true,
            strict_table_acl: false,
            enable_table_acl_dry_run: false,
            table_acl_exempt_acl: Vec::new(),
            terse_errors: false,
            enable_autocommit: false,
            row_cache: RowCacheConfig::default(),
            query_rules_file: None,
            table_acl_file: None,
            schema_overrides: Vec::new(),
        }
    }
}

impl TabletConfig {
    pub fn transaction_timeout(&self) -> Duration {
        secs(self.transaction_timeout_secs)
    }

    pub fn tx_pool_timeout(&self) -> Duration {
        secs(self.tx_pool_timeout_secs)
    }

    pub fn pool_timeout(&self) -> Duration {
        secs(self.pool_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        secs(self.idle_timeout_secs)
    }

    pub fn schema_reload_time(&self) -> Duration {
        secs(self.schema_reload_time_secs)
    }

    /// `None` when no per-statement timeout is configured.
    pub fn query_timeout(&self) -> Option<Duration> {
        if self.query_timeout_secs > 0.0 {
            Some(secs(self.query_timeout_secs))
        } else {
            None
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_stream_pool_size() -> usize {
    DEFAULT_STREAM_POOL_SIZE
}
fn default_transaction_cap() -> usize {
    DEFAULT_TRANSACTION_CAP
}
fn default_transaction_timeout() -> f64 {
    DEFAULT_TRANSACTION_TIMEOUT_SECS
}
fn default_tx_pool_timeout() -> f64 {
    DEFAULT_TX_POOL_TIMEOUT_SECS
}
fn default_pool_timeout() -> f64 {
    DEFAULT_POOL_TIMEOUT_SECS
}
fn default_idle_timeout() -> f64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}
fn default_max_result_size() -> usize {
    DEFAULT_MAX_RESULT_SIZE
}
fn default_max_dml_rows() -> usize {
    DEFAULT_MAX_DML_ROWS
}
fn default_stream_buffer_size() -> usize {
    DEFAULT_STREAM_BUFFER_SIZE
}
fn default_query_cache_size() -> u64 {
    DEFAULT_QUERY_CACHE_SIZE
}
fn default_schema_reload_time() -> f64 {
    DEFAULT_SCHEMA_RELOAD_TIME_SECS
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct RowCacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Maximum cached rows across all tables
    #[serde(default = "default_row_cache_capacity")]
    #[validate(range(min = 1))]
    pub capacity: u64,

    /// Zero keeps entries until evicted or invalidated
    #[serde(default)]
    pub ttl_secs: u64,

    /// Probability that a cache hit is re-verified against the database
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub spot_check_ratio: f64,

    /// Per-call budget for the cache backend
    #[serde(default = "default_row_cache_timeout")]
    pub timeout_ms: u64,
}

impl Default for RowCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: default_row_cache_capacity(),
            ttl_secs: 0,
            spot_check_ratio: 0.0,
            timeout_ms: default_row_cache_timeout(),
        }
    }
}

impl RowCacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_row_cache_capacity() -> u64 {
    DEFAULT_ROW_CACHE_CAPACITY
}
fn default_row_cache_timeout() -> u64 {
    DEFAULT_ROW_CACHE_TIMEOUT_MS
}

/// Per-table schema correction.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SchemaOverride {
    pub name: String,
    #[serde(default)]
    pub pk_columns: Vec<String>,
    /// Force row cache eligibility on (`true`) or off (`false`)
    #[serde(default)]
    pub cache: Option<bool>,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    /// Write the `queries` target to a daily-rolling file
    #[serde(default)]
    pub query_log: bool,

    /// Write the `audit` target to a daily-rolling file
    #[serde(default)]
    pub audit_log: bool,

    #[serde(default = "default_log_dir")]
    #[validate(length(min = 1))]
    pub log_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            query_log: false,
            audit_log: false,
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    DEFAULT_LOG_DIR.to_string()
}

#[derive(Debug, Deserialize, Default, Clone, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub tablet: TabletConfig,
    #[serde(default)]
    #[validate(nested)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from an optional file plus `TABLET_*` environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        // Map TABLET_TABLET__POOL_SIZE to tablet.pool_size, etc.
        let builder = builder.add_source(
            config::Environment::with_prefix(DEFAULT_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;

        Ok(app_config)
    }
}
