//! Database engine module - the blocking side of the bridge.
//!
//! This module provides:
//! - `Engine`: shared factory producing new low-level connections
//! - `DbConnection`: the operations every pooled connection supports
//! - `DuckDbEngine` / `DuckDbConnection`: the DuckDB implementation

pub mod connection;
pub mod factory;

pub use connection::DuckDbConnection;
pub use factory::{DatabaseLocation, DuckDbEngine};

use crate::error::PoolError;
use crate::types::Row;

/// Shared, stateless connection factory.
///
/// One engine is shared by every worker thread, so `connect` may be called
/// concurrently.
pub trait Engine: Send + Sync + 'static {
    type Connection: DbConnection;

    /// Open a new connection. Called on a worker thread.
    fn connect(&self) -> Result<Self::Connection, PoolError>;

    /// Location of the database, for logging.
    fn url(&self) -> &str;
}

/// Blocking operations available on a single database connection.
///
/// A connection is only ever used by the worker thread that opened it.
pub trait DbConnection: Send + 'static {
    /// Run one statement and return the number of affected rows.
    fn execute(&mut self, statement: &str) -> Result<usize, PoolError>;

    /// Run several `;`-separated statements.
    fn execute_batch(&mut self, sql: &str) -> Result<(), PoolError>;

    /// Run a query and collect every row.
    fn query(&mut self, statement: &str) -> Result<Vec<Row>, PoolError>;

    fn begin(&mut self) -> Result<(), PoolError>;

    fn commit(&mut self) -> Result<(), PoolError>;

    fn rollback(&mut self) -> Result<(), PoolError>;

    /// Release the underlying driver connection. Must be idempotent.
    fn close(&mut self) -> Result<(), PoolError>;
}
