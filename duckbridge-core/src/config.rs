use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::factory::parse_database_url;
use crate::error::PoolError;

const ENV_PREFIX: &str = "DUCKBRIDGE";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Database to open, e.g. `duckdb:///:memory:` or `duckdb:///data/app.db`.
    pub database_url: String,
    /// DuckDB settings applied when the database is first opened.
    #[serde(default)]
    pub engine_options: BTreeMap<String, String>,
    #[serde(default)]
    pub session: SessionOptions,
    /// Worker threads kept alive while the pool is running.
    pub min_threads: usize,
    /// Upper bound on live worker threads.
    pub max_threads: usize,
    /// Idle time after which a worker above `min_threads` exits.
    pub idle_timeout_ms: u64,
    /// Prefix for worker thread names.
    pub thread_name: String,
    /// Log format: "compact" or "json".
    pub log_format: String,
}

/// Per-connection settings applied to every freshly opened connection.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionOptions {
    /// SQL executed once on each new connection (SET, ATTACH, ...).
    pub init_sql: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_url: "duckdb:///:memory:".to_string(),
            engine_options: BTreeMap::new(),
            session: SessionOptions::default(),
            min_threads: 3,
            max_threads: 5,
            idle_timeout_ms: 30_000,
            thread_name: "duckbridge".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

impl PoolConfig {
    /// Defaults overlaid with `DUCKBRIDGE_*` environment variables.
    pub fn load() -> Result<Self, PoolError> {
        Self::build(None)
    }

    /// Defaults overlaid with a config file, then with the environment.
    pub fn load_from(path: &Path) -> Result<Self, PoolError> {
        Self::build(Some(path))
    }

    fn build(path: Option<&Path>) -> Result<Self, PoolError> {
        let defaults_json = serde_json::to_string(&Self::default())
            .map_err(|e| PoolError::Config(format!("failed to serialize defaults: {e}")))?;
        let mut builder = config::Config::builder().add_source(
            config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
        );
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| PoolError::Config(format!("failed to load configuration: {e}")))?;
        let cfg: PoolConfig = settings
            .try_deserialize()
            .map_err(|e| PoolError::Config(format!("failed to deserialize configuration: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_threads == 0 {
            return Err(PoolError::Config(
                "max_threads must be greater than 0".to_string(),
            ));
        }
        if self.min_threads > self.max_threads {
            return Err(PoolError::Config(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        if self.thread_name.trim().is_empty() {
            return Err(PoolError::Config("thread_name must not be empty".to_string()));
        }
        match self.log_format.as_str() {
            "compact" | "json" => {}
            other => {
                return Err(PoolError::Config(format!(
                    "unknown log_format `{other}` (expected compact or json)"
                )))
            }
        }
        parse_database_url(&self.database_url)?;
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_match_the_classic_bounds() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_threads, 3);
        assert_eq!(config.max_threads, 5);
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn min_above_max_is_rejected() {
        let config = PoolConfig {
            min_threads: 6,
            max_threads: 2,
            ..PoolConfig::default()
        };
        let err = config.validate().err();
        assert!(matches!(err, Some(PoolError::Config(msg)) if msg.contains("exceeds")));
    }

    #[test]
    fn zero_max_threads_is_rejected() {
        let config = PoolConfig {
            min_threads: 0,
            max_threads: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unsupported_database_scheme_is_rejected() {
        let config = PoolConfig {
            database_url: "sqlite:///test.db".to_string(),
            ..PoolConfig::default()
        };
        assert!(matches!(config.validate(), Err(PoolError::Config(_))));
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let config = PoolConfig {
            log_format: "yaml".to_string(),
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("DUCKBRIDGE_MAX_THREADS", "9");
        let loaded = PoolConfig::load();
        std::env::remove_var("DUCKBRIDGE_MAX_THREADS");
        let config = loaded.expect("configuration should load");
        assert_eq!(config.max_threads, 9);
        assert_eq!(config.min_threads, 3);
    }
}
