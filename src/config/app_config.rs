use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError};
use serde::Deserialize;

use crate::domain::cache::DEFAULT_NAMESPACE;
use crate::infrastructure::cache::{StoreConfig, StoreType};
use crate::infrastructure::services::{TaggedCacheConfig, DEFAULT_SCAN_PAGE_SIZE};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub store: StoreSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Backend selection and connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreType,
    pub redis_url: Option<String>,
    pub connection_timeout_secs: u64,
    pub response_timeout_secs: u64,
}

/// Keyspace and invalidation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub namespace: String,
    pub scan_page_size: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreType::default(),
            redis_url: None,
            connection_timeout_secs: 5,
            response_timeout_secs: 5,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_builder(
            config::Config::builder()
                .add_source(config::File::with_name("config/default").required(false))
                .add_source(config::File::with_name("config/local").required(false))
                .add_source(
                    config::Environment::with_prefix("APP")
                        .separator("__")
                        .try_parsing(true),
                ),
        )
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder.build()?.try_deserialize()
    }

    /// Settings for the store factory
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            store_type: self.store.backend,
            redis_url: self.store.redis_url.clone(),
            connection_timeout: Duration::from_secs(self.store.connection_timeout_secs),
            response_timeout: Duration::from_secs(self.store.response_timeout_secs),
        }
    }

    /// Settings for the tagged cache service
    pub fn cache_config(&self) -> TaggedCacheConfig {
        TaggedCacheConfig::default()
            .with_namespace(self.cache.namespace.clone())
            .with_scan_page_size(self.cache.scan_page_size)
    }
}
