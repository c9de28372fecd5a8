//! Asynchronous access to blocking DuckDB connections.
//!
//! DuckDB only exposes blocking calls. This crate runs them on a bounded pool
//! of worker threads, each owning one cached connection, and hands the results
//! back to a single-threaded event loop through [`CompletionHandle`]s.
//!
//! ## Example
//!
//! ```rust,no_run
//! use duckbridge_core::{ConnectionPool, Operation, PoolConfig, Reactor};
//!
//! let reactor = Reactor::new();
//! let pool = ConnectionPool::open(&reactor, &PoolConfig::default())?;
//!
//! let affected = reactor.run({
//!     let pool = pool.clone();
//!     async move {
//!         pool.run_with_connection(Operation::ExecuteBatch(
//!             "CREATE TABLE t (id INTEGER)".to_string(),
//!         ))
//!         .await?;
//!         pool.run_with_connection(Operation::Execute(
//!             "INSERT INTO t VALUES (1)".to_string(),
//!         ))
//!         .await
//!     }
//! })??;
//! println!("{affected:?}");
//! # Ok::<(), duckbridge_core::PoolError>(())
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod id;
pub mod metrics;
pub mod pool;
pub mod reactor;
pub mod threadpool;
pub mod types;

pub use config::{PoolConfig, SessionOptions};
pub use engine::{DbConnection, DuckDbConnection, DuckDbEngine, Engine};
pub use error::{PoolError, PoolErrorKind};
pub use pool::{
    CompletionHandle, ConnectionPool, LifecycleState, Operation, OperationOutput,
    PoolSnapshot, PooledConnection,
};
pub use reactor::{Phase, Reactor, SystemEvent};
pub use types::{Row, Value};
