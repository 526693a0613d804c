use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub repository: RepositoryConfig,
    pub graph: GraphConfig,
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Actor recorded in modification metadata when a request names none
    pub default_user: String,
    /// Longest indexed string stored without trimming on retries
    pub indexed_string_safe_length: usize,
    pub delete_mode: DeleteMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub edge_retries: u32,
    pub retry_sleep_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub min_retry_interval_ms: u64,
    pub max_retry_interval_ms: u64,
    pub failed_cache_size: usize,
    pub queue_capacity: usize,
    /// Entities in create and full-update messages whose `qualifiedName`
    /// fully matches one of these regular expressions are skipped
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            default_user: "admin".to_string(),
            indexed_string_safe_length: i16::MAX as usize,
            delete_mode: DeleteMode::Soft,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            edge_retries: 3,
            retry_sleep_ms: 1000,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval_ms: 500,
            min_retry_interval_ms: 500,
            max_retry_interval_ms: 500 * 60,
            failed_cache_size: 1,
            queue_capacity: 256,
            ignore_patterns: Vec::new(),
        }
    }
}

impl GraphConfig {
    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }
}

impl ConsumerConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional `metagraph` config file and the environment
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        config = config.add_source(config::Config::try_from(&AppConfig::default())?);

        config = config.add_source(config::File::with_name("metagraph").required(false));

        // Nested keys use a double underscore: METAGRAPH_GRAPH__EDGE_RETRIES=5
        // Lists are comma separated: METAGRAPH_CONSUMER__IGNORE_PATTERNS=tmp\..*,scratch\..*
        config = config.add_source(
            config::Environment::with_prefix("METAGRAPH")
                .separator("__")
                .prefix_separator("_")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("consumer.ignore_patterns"),
        );

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }
}
