use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub hooks: HookConfig,
    #[serde(default)]
    pub orders: OrderConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Settings handed to each plugin when it is bound, keyed by plugin name
    #[serde(default)]
    pub plugins: BTreeMap<String, Value>,
    /// CLI state file (default: ~/.tradeflow/state.json)
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Extra attempts for a node whose collaborator call errored
    #[serde(default = "default_max_node_retries")]
    pub max_node_retries: u32,
    /// First retry delay; doubles per attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Budget applied to compiled flows
    #[serde(default = "default_max_execution_time_ms")]
    pub default_max_execution_time_ms: u64,
}

fn default_max_node_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_execution_time_ms() -> u64 {
    60_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_node_retries: default_max_node_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            default_max_execution_time_ms: default_max_execution_time_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Task table size above which finished entries are evicted
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    /// `wait_all` polling period
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Applied to tasks enqueued without their own timeout
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_tasks() -> usize {
    1000
}

fn default_poll_interval() -> u64 {
    50
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_tasks: default_max_tasks(),
            poll_interval_ms: default_poll_interval(),
            default_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
}

fn default_handler_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
            continue_on_error: true,
        }
    }
}

/// Which plugin operations compiled order flows call
#[derive(Debug, Clone, Deserialize)]
pub struct OrderConfig {
    #[serde(default = "default_plugin")]
    pub plugin: String,
    #[serde(default = "default_price_provider")]
    pub price_provider: String,
    #[serde(default = "default_snapshot_provider")]
    pub snapshot_provider: String,
    #[serde(default = "default_swap_action")]
    pub swap_action: String,
    #[serde(default = "default_notify_action")]
    pub notify_action: String,
    /// Check cadence for price-watching orders
    #[serde(default = "default_check_interval_ms")]
    pub default_check_interval_ms: u64,
    #[serde(default = "default_slippage_bps")]
    pub default_slippage_bps: u32,
    /// Quote token paired with the watched token in swaps
    #[serde(default = "default_quote_token")]
    pub quote_token: String,
}

fn default_plugin() -> String {
    "paper".to_string()
}

fn default_price_provider() -> String {
    "price".to_string()
}

fn default_snapshot_provider() -> String {
    "token_snapshot".to_string()
}

fn default_swap_action() -> String {
    "swap".to_string()
}

fn default_notify_action() -> String {
    "notify".to_string()
}

fn default_check_interval_ms() -> u64 {
    60_000
}

fn default_slippage_bps() -> u32 {
    100
}

fn default_quote_token() -> String {
    "USDC".to_string()
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin(),
            price_provider: default_price_provider(),
            snapshot_provider: default_snapshot_provider(),
            swap_action: default_swap_action(),
            notify_action: default_notify_action(),
            default_check_interval_ms: default_check_interval_ms(),
            default_slippage_bps: default_slippage_bps(),
            quote_token: default_quote_token(),
        }
    }
}

/// Static market data served by the paper plugin
#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_prices")]
    pub prices: BTreeMap<String, Decimal>,
    /// Extra per-token fields (mcap, volume, ...) returned by the snapshot provider
    #[serde(default)]
    pub snapshots: BTreeMap<String, BTreeMap<String, Value>>,
    /// Fail every swap, for exercising error branches
    #[serde(default)]
    pub fail_swaps: bool,
}

fn default_prices() -> BTreeMap<String, Decimal> {
    BTreeMap::from([
        ("BTC".to_string(), dec!(60000)),
        ("ETH".to_string(), dec!(3000)),
        ("SOL".to_string(), dec!(150)),
        ("USDC".to_string(), dec!(1)),
    ])
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            prices: default_prices(),
            snapshots: BTreeMap::new(),
            fail_swaps: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rolling log file; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
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
            .set_default("tasks.max_concurrent", 5)?
            .set_default("hooks.handler_timeout_ms", 5000)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRADEFLOW_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TRADEFLOW_TASKS__MAX_CONCURRENT, etc.)
            .add_source(
                Environment::with_prefix("TRADEFLOW")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// State file path, falling back to ~/.tradeflow/state.json
    pub fn state_path(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".tradeflow")
                .join("state.json")
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.tasks.max_concurrent == 0 {
            errors.push("tasks.max_concurrent must be at least 1".to_string());
        }
        if self.tasks.poll_interval_ms == 0 {
            errors.push("tasks.poll_interval_ms must be positive".to_string());
        }
        if self.engine.default_max_execution_time_ms == 0 {
            errors.push("engine.default_max_execution_time_ms must be positive".to_string());
        }
        if self.orders.default_check_interval_ms == 0 {
            errors.push("orders.default_check_interval_ms must be positive".to_string());
        }
        for (token, price) in &self.paper.prices {
            if *price <= Decimal::ZERO {
                errors.push(format!("paper.prices.{} must be positive", token));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.max_node_retries, 3);
        assert_eq!(config.tasks.max_tasks, 1000);
        assert_eq!(config.orders.plugin, "paper");
        assert_eq!(config.paper.prices.get("ETH"), Some(&dec!(3000)));
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        let config = AppConfig::load_from("/nonexistent/tradeflow-config").unwrap();
        assert_eq!(config.hooks.handler_timeout_ms, 5000);
        assert!(config.hooks.continue_on_error);
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = AppConfig::default();
        config.tasks.max_concurrent = 0;
        config.paper.prices.insert("BAD".into(), Decimal::ZERO);
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
