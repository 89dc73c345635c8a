use chrono::Weekday;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub website: WebsiteConfig,
    pub fetcher: FetcherConfig,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub stream: StreamConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebsiteConfig {
    pub separator: String,
    pub max_tracked_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    pub request_timeout: u64,
    pub retry_attempts: usize,
    pub retry_delay_ms: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub worker_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub exec_at_beginning: bool,
    pub sleep_interval_ms: u64,
    pub rescan_weekday: String,
    pub rescan_hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub backend: StreamBackend,
    pub url: String,
    pub consumer: String,
    pub host_classes: Vec<String>,
    pub claim_idle_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebsiteConfig {
    fn default() -> Self {
        Self {
            separator: "\n".to_string(),
            max_tracked_entries: 2,
        }
    }
}

impl FetcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

impl SchedulerConfig {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    pub fn weekday(&self) -> Result<Weekday, ConfigError> {
        self.rescan_weekday.parse::<Weekday>().map_err(|_| {
            ConfigError::Message(format!("Invalid rescan weekday: {}", self.rescan_weekday))
        })
    }
}

impl StreamConfig {
    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl AppConfig {
    /// Defaults, then the optional config file, then `WEB_HISTORY__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults(Config::builder())?;

        builder = match path {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(File::with_name("config/default").required(false)),
        };

        let s = builder
            .add_source(
                Environment::with_prefix("WEB_HISTORY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("stream.host_classes")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("website.separator", "\n")?
            .set_default("website.max_tracked_entries", 2)?
            .set_default("fetcher.request_timeout", 30)?
            .set_default("fetcher.retry_attempts", 2)?
            .set_default("fetcher.retry_delay_ms", 10_000)?
            .set_default("fetcher.user_agent", "WebHistory/0.1")?
            .set_default("executor.worker_count", 5)?
            .set_default("scheduler.exec_at_beginning", true)?
            .set_default("scheduler.sleep_interval_ms", 1_000)?
            .set_default("scheduler.rescan_weekday", "Fri")?
            .set_default("scheduler.rescan_hour", 4)?
            .set_default("stream.backend", "sqlite")?
            .set_default("stream.url", "sqlite://web_history_stream.db")?
            .set_default("stream.consumer", "worker-1")?
            .set_default("stream.host_classes", vec!["default"])?
            .set_default("stream.claim_idle_ms", 300_000)?
            .set_default("stream.poll_interval_ms", 1_000)?
            .set_default("database.url", "sqlite://web_history.db")?
            .set_default("database.max_connections", 5)?
            .set_default("logging.level", "info")?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.port", 9001)?
            .set_default("shutdown_timeout", 60)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate website configuration
        if self.website.separator.is_empty() {
            return Err(ConfigError::Message("Website separator must not be empty".into()));
        }

        if self.website.max_tracked_entries == 0 {
            return Err(ConfigError::Message(
                "Website max_tracked_entries must be greater than 0".into(),
            ));
        }

        // Validate executor configuration
        if self.executor.worker_count == 0 {
            return Err(ConfigError::Message("Executor worker_count must be greater than 0".into()));
        }

        // Validate scheduler configuration
        self.scheduler.weekday()?;

        if self.scheduler.rescan_hour > 23 {
            return Err(ConfigError::Message("Scheduler rescan_hour must be between 0 and 23".into()));
        }

        // Validate stream configuration
        if self.stream.consumer.is_empty() {
            return Err(ConfigError::Message("Stream consumer name must not be empty".into()));
        }

        if self.stream.poll_interval_ms == 0 {
            return Err(ConfigError::Message("Stream poll_interval_ms must be greater than 0".into()));
        }

        // Validate database configuration
        if self.database.max_connections == 0 {
            return Err(ConfigError::Message("Database max_connections must be greater than 0".into()));
        }

        // Validate metrics configuration
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(ConfigError::Message("Metrics port must be greater than 0".into()));
        }

        Ok(())
    }
}
