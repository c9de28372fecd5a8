//! DuckDB connection with the blocking operations the pool forwards to.

use duckdb::types::Value as DuckValue;
use duckdb::Connection;
use tracing::{debug, instrument};

use crate::engine::DbConnection;
use crate::error::PoolError;
use crate::types::{Row, Value};

const NO_ACTIVE_TRANSACTION: &str = "no transaction is active";

/// Wrapper around `duckdb::Connection`.
///
/// The driver connection is taken out on `close`, after which every operation
/// fails with [`PoolError::ConnectionClosed`].
pub struct DuckDbConnection {
    conn: Option<Connection>,
}

impl DuckDbConnection {
    pub fn new(conn: Connection) -> Self {
        Self { conn: Some(conn) }
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    fn live(&self) -> Result<&Connection, PoolError> {
        self.conn.as_ref().ok_or(PoolError::ConnectionClosed)
    }

    fn check_sql(sql: &str) -> Result<(), PoolError> {
        if sql.contains('\0') {
            return Err(PoolError::InvalidArguments {
                operation: "sql",
                reason: "SQL contains null bytes".to_string(),
            });
        }
        Ok(())
    }

    /// Run a transaction-control statement, treating "no transaction is
    /// active" as success so that autocommit connections can always be
    /// committed or rolled back.
    fn end_transaction(&self, sql: &str) -> Result<(), PoolError> {
        match self.live()?.execute_batch(sql) {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains(NO_ACTIVE_TRANSACTION) => {
                debug!(statement = sql, "no active transaction");
                Ok(())
            }
            Err(err) => Err(PoolError::DuckDb(err)),
        }
    }
}

impl DbConnection for DuckDbConnection {
    #[instrument(skip(self), fields(sql = %statement))]
    fn execute(&mut self, statement: &str) -> Result<usize, PoolError> {
        Self::check_sql(statement)?;
        let affected = self.live()?.execute(statement, [])?;
        debug!(affected, "executed statement");
        Ok(affected)
    }

    #[instrument(skip(self), fields(sql = %sql))]
    fn execute_batch(&mut self, sql: &str) -> Result<(), PoolError> {
        Self::check_sql(sql)?;
        self.live()?.execute_batch(sql)?;
        debug!("executed batch");
        Ok(())
    }

    #[instrument(skip(self), fields(sql = %statement))]
    fn query(&mut self, statement: &str) -> Result<Vec<Row>, PoolError> {
        Self::check_sql(statement)?;
        let conn = self.live()?;
        let mut stmt = conn.prepare(statement)?;
        let mut rows = stmt.query([])?;
        let width = rows.as_ref().map(|s| s.column_count()).unwrap_or(0);

        let mut collected = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(Value::from(row.get::<_, DuckValue>(idx)?));
            }
            collected.push(values);
        }
        debug!(rows = collected.len(), columns = width, "executed query");
        Ok(collected)
    }

    fn begin(&mut self) -> Result<(), PoolError> {
        self.live()?.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), PoolError> {
        self.end_transaction("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), PoolError> {
        self.end_transaction("ROLLBACK")
    }

    fn close(&mut self) -> Result<(), PoolError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, err)| PoolError::DuckDb(err))?;
            debug!("closed DuckDB connection");
        }
        Ok(())
    }
}
