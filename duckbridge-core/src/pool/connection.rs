//! Per-task connection wrapper.

use tracing::{debug, error, info};

use crate::engine::{DbConnection, Engine};
use crate::error::PoolError;
use crate::id::ConnectionId;
use crate::pool::cache::CachedConnection;
use crate::pool::operation::{Operation, OperationOutput};
use crate::pool::PoolShared;
use crate::types::Row;

/// Handle to the current worker thread's cached connection, valid for one
/// unit of work.
///
/// Dropping the wrapper, or calling [`PooledConnection::close`], leaves the
/// cached connection open for the next task on the same thread.
pub struct PooledConnection<'p, E: Engine> {
    shared: &'p PoolShared<E>,
    current: Option<CachedConnection<E::Connection>>,
}

impl<'p, E: Engine> PooledConnection<'p, E> {
    /// Acquire this thread's connection, replacing it first when an earlier
    /// task flagged it as broken.
    pub(crate) fn new(shared: &'p PoolShared<E>) -> Result<Self, PoolError> {
        let mut conn = Self {
            shared,
            current: None,
        };
        conn.acquire()?;
        if conn.current.as_ref().is_some_and(CachedConnection::is_broken) {
            debug!(connection_id = ?conn.connection_id(), "cached connection is broken");
            conn.reconnect()?;
        }
        Ok(conn)
    }

    fn acquire(&mut self) -> Result<(), PoolError> {
        let (entry, created) = self.shared.cache.connect(|| self.shared.engine.connect())?;
        if created {
            self.shared.metrics.record_connection_opened();
            info!(
                connection_id = %entry.id(),
                thread = ?std::thread::current().name(),
                url = self.shared.engine.url(),
                "opened connection for worker thread"
            );
        }
        self.current = Some(entry);
        Ok(())
    }

    /// Drop the current connection through the pool and acquire a new one.
    /// Other threads' connections are untouched.
    pub fn reconnect(&mut self) -> Result<(), PoolError> {
        if let Some(entry) = self.current.take() {
            let id = entry.id();
            drop(entry);
            self.shared.disconnect(id, "reconnect");
            self.shared.metrics.record_reconnect();
            info!(connection_id = %id, "reconnecting");
        }
        self.acquire()
    }

    /// Does nothing: the pool owns the lifetime of the real connection.
    pub fn close(&mut self) {}

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.current.as_ref().map(CachedConnection::id)
    }

    /// Flag the connection so the next task on this thread reconnects.
    pub fn mark_broken(&self) {
        if let Some(entry) = &self.current {
            entry.mark_broken();
        }
    }

    fn with_connection<T>(
        &mut self,
        f: impl FnOnce(&mut E::Connection) -> Result<T, PoolError>,
    ) -> Result<T, PoolError> {
        let entry = self.current.as_ref().ok_or(PoolError::ConnectionClosed)?;
        let mut guard = entry.lock();
        f(&mut *guard)
    }

    pub fn execute(&mut self, statement: &str) -> Result<usize, PoolError> {
        self.with_connection(|conn| conn.execute(statement))
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<(), PoolError> {
        self.with_connection(|conn| conn.execute_batch(sql))
    }

    pub fn query(&mut self, statement: &str) -> Result<Vec<Row>, PoolError> {
        self.with_connection(|conn| conn.query(statement))
    }

    pub fn begin(&mut self) -> Result<(), PoolError> {
        self.with_connection(|conn| conn.begin())
    }

    pub fn commit(&mut self) -> Result<(), PoolError> {
        self.with_connection(|conn| conn.commit())
    }

    pub fn rollback(&mut self) -> Result<(), PoolError> {
        self.with_connection(|conn| conn.rollback())
    }

    /// Run a named operation against the connection.
    pub fn invoke(&mut self, operation: &Operation) -> Result<OperationOutput, PoolError> {
        match operation {
            Operation::Execute(sql) => self.execute(sql).map(OperationOutput::Affected),
            Operation::ExecuteBatch(sql) => {
                self.execute_batch(sql).map(|()| OperationOutput::Done)
            }
            Operation::Query(sql) => self.query(sql).map(OperationOutput::Rows),
            Operation::Begin => self.begin().map(|()| OperationOutput::Done),
            Operation::Commit => self.commit().map(|()| OperationOutput::Done),
            Operation::Rollback => self.rollback().map(|()| OperationOutput::Done),
            Operation::Reconnect => self.reconnect().map(|()| OperationOutput::Done),
            Operation::Close => {
                self.close();
                Ok(OperationOutput::Done)
            }
        }
    }

    /// Roll back after `err` failed the current unit of work.
    ///
    /// A rollback failure is logged and counted but never replaces `err`.
    pub(crate) fn abort(&mut self, err: &PoolError) {
        if err.is_connection_failure() {
            self.mark_broken();
        }
        self.shared.metrics.record_rollback();
        if let Err(rollback_err) = self.rollback() {
            error!(
                connection_id = ?self.connection_id(),
                error = %err,
                rollback_error = %rollback_err,
                "rollback failed"
            );
            self.shared
                .metrics
                .record_rollback_failure(rollback_err.to_string());
            if rollback_err.is_connection_failure() {
                self.mark_broken();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DuckDbEngine;
    use crate::types::Value;
    use std::collections::BTreeMap;

    fn shared() -> PoolShared<DuckDbEngine> {
        PoolShared::new(DuckDbEngine::new("duckdb://", BTreeMap::new()).unwrap())
    }

    #[test]
    fn wrappers_on_one_thread_share_the_cached_connection() {
        let shared = shared();
        let first = PooledConnection::new(&shared).unwrap().connection_id();
        let second = PooledConnection::new(&shared).unwrap().connection_id();
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(shared.metrics.snapshot().connections_opened, 1);
    }

    #[test]
    fn close_is_a_no_op() {
        let shared = shared();
        let mut conn = PooledConnection::new(&shared).unwrap();
        conn.close();
        assert_eq!(
            conn.query("SELECT 1").unwrap(),
            vec![vec![Value::Integer(1)]]
        );
        assert_eq!(
            conn.invoke(&Operation::Close).unwrap(),
            OperationOutput::Done
        );
        assert_eq!(shared.cache.len(), 1);
    }

    #[test]
    fn reconnect_replaces_only_this_threads_connection() {
        let shared = shared();
        let mut conn = PooledConnection::new(&shared).unwrap();
        let before = conn.connection_id();
        conn.reconnect().unwrap();
        let after = conn.connection_id();

        assert_ne!(before, after);
        assert_eq!(shared.cache.len(), 1);
        let metrics = shared.metrics.snapshot();
        assert_eq!(metrics.reconnects, 1);
        assert_eq!(metrics.connections_opened, 2);
        assert_eq!(metrics.connections_closed, 1);
    }

    #[test]
    fn broken_connection_is_replaced_on_next_acquire() {
        let shared = shared();
        let before = {
            let conn = PooledConnection::new(&shared).unwrap();
            conn.mark_broken();
            conn.connection_id()
        };
        let conn = PooledConnection::new(&shared).unwrap();
        assert_ne!(conn.connection_id(), before);
        assert_eq!(shared.metrics.snapshot().reconnects, 1);
    }

    #[test]
    fn named_operations_reach_the_connection() {
        let shared = shared();
        let mut conn = PooledConnection::new(&shared).unwrap();
        conn.invoke(&Operation::ExecuteBatch("CREATE TABLE t (id INTEGER)".into()))
            .unwrap();
        conn.invoke(&Operation::Begin).unwrap();
        let affected = conn
            .invoke(&Operation::Execute("INSERT INTO t VALUES (1), (2)".into()))
            .unwrap();
        assert_eq!(affected, OperationOutput::Affected(2));
        conn.invoke(&Operation::Rollback).unwrap();

        let rows = conn
            .invoke(&Operation::Query("SELECT count(*) FROM t".into()))
            .unwrap();
        assert_eq!(rows, OperationOutput::Rows(vec![vec![Value::Integer(0)]]));
    }

    #[test]
    fn abort_after_a_driver_error_rolls_back_quietly() {
        let shared = shared();
        let mut conn = PooledConnection::new(&shared).unwrap();
        let err = conn.execute("SELEC 1").unwrap_err();
        conn.abort(&err);

        let metrics = shared.metrics.snapshot();
        assert_eq!(metrics.rollbacks, 1);
        assert_eq!(metrics.rollback_failures, 0);
        assert!(PooledConnection::new(&shared).unwrap().connection_id() == conn.connection_id());
    }
}
