//! DuckDB engine: the shared connection factory.
//!
//! The engine opens one root database handle on first use and hands every
//! worker a `try_clone` of it, so all pooled connections see the same
//! database (including in-memory ones).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use duckdb::{Config, Connection};
use tracing::{debug, info, instrument};

use crate::config::PoolConfig;
use crate::engine::connection::DuckDbConnection;
use crate::engine::Engine;
use crate::error::PoolError;

const URL_SCHEME: &str = "duckdb://";
const MEMORY: &str = ":memory:";

/// Where a `duckdb://` URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    InMemory,
    File(PathBuf),
}

/// Parse `duckdb://`, `duckdb:///:memory:`, `duckdb:///relative.db` or
/// `duckdb:////absolute/path.db`.
pub fn parse_database_url(url: &str) -> Result<DatabaseLocation, PoolError> {
    let rest = url.strip_prefix(URL_SCHEME).ok_or_else(|| {
        PoolError::Config(format!(
            "unsupported database url `{url}` (expected {URL_SCHEME}...)"
        ))
    })?;
    let path = rest.strip_prefix('/').unwrap_or(rest);
    if path.is_empty() || path == MEMORY {
        return Ok(DatabaseLocation::InMemory);
    }
    Ok(DatabaseLocation::File(PathBuf::from(path)))
}

/// Engine producing DuckDB connections.
pub struct DuckDbEngine {
    url: String,
    location: DatabaseLocation,
    options: BTreeMap<String, String>,
    init_sql: Option<String>,
    root: Mutex<Option<Connection>>,
}

impl DuckDbEngine {
    /// Validate the URL; the database itself is opened lazily.
    pub fn new(url: &str, options: BTreeMap<String, String>) -> Result<Self, PoolError> {
        let location = parse_database_url(url)?;
        Ok(Self {
            url: url.to_string(),
            location,
            options,
            init_sql: None,
            root: Mutex::new(None),
        })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        let engine = Self::new(&config.database_url, config.engine_options.clone())?;
        Ok(match config.session.init_sql.as_deref().map(str::trim) {
            Some(sql) if !sql.is_empty() => engine.with_init_sql(sql),
            _ => engine,
        })
    }

    /// SQL run on every connection handed out by this engine.
    pub fn with_init_sql(mut self, sql: &str) -> Self {
        self.init_sql = Some(sql.to_string());
        self
    }

    fn open_root(&self) -> Result<Connection, PoolError> {
        let mut config = Config::default();
        for (key, value) in &self.options {
            config = config.with(key, value)?;
        }
        let conn = match &self.location {
            DatabaseLocation::InMemory => Connection::open_in_memory_with_flags(config)?,
            DatabaseLocation::File(path) => Connection::open_with_flags(path, config)?,
        };
        info!(url = %self.url, options = self.options.len(), "opened DuckDB database");
        Ok(conn)
    }
}

impl Engine for DuckDbEngine {
    type Connection = DuckDbConnection;

    #[instrument(skip(self), fields(url = %self.url))]
    fn connect(&self) -> Result<DuckDbConnection, PoolError> {
        let conn = {
            let mut root = self
                .root
                .lock()
                .map_err(|_| PoolError::Internal("engine mutex poisoned".to_string()))?;
            if root.is_none() {
                *root = Some(self.open_root()?);
            }
            root.as_ref()
                .ok_or_else(|| PoolError::Internal("root connection missing".to_string()))?
                .try_clone()?
        };
        if let Some(sql) = &self.init_sql {
            conn.execute_batch(sql)?;
        }
        debug!("created DuckDB connection");
        Ok(DuckDbConnection::new(conn))
    }

    fn url(&self) -> &str {
        &self.url
    }
}
