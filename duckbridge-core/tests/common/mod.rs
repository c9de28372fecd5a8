#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use duckbridge_core::{DbConnection, Engine, PoolConfig, PoolError, Row, Value};

pub const FAIL: &str = "fail";
pub const LOSE_CONNECTION: &str = "lose connection";

/// Counts every call the pool makes into the engine and its connections.
#[derive(Default)]
pub struct Calls {
    pub connects: AtomicUsize,
    pub executes: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_rollback: AtomicBool,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct RecordingEngine {
    calls: Arc<Calls>,
}

impl RecordingEngine {
    pub fn new() -> (Self, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        (
            Self {
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl Engine for RecordingEngine {
    type Connection = RecordingConnection;

    fn connect(&self) -> Result<RecordingConnection, PoolError> {
        self.calls.connects.fetch_add(1, Ordering::SeqCst);
        Ok(RecordingConnection {
            calls: self.calls.clone(),
        })
    }

    fn url(&self) -> &str {
        "recording://"
    }
}

pub struct RecordingConnection {
    calls: Arc<Calls>,
}

impl DbConnection for RecordingConnection {
    fn execute(&mut self, statement: &str) -> Result<usize, PoolError> {
        self.calls.executes.fetch_add(1, Ordering::SeqCst);
        match statement {
            FAIL => Err(PoolError::driver(io::Error::new(
                io::ErrorKind::InvalidInput,
                "syntax error at end of input",
            ))),
            LOSE_CONNECTION => Err(PoolError::Connection("link dropped".to_string())),
            _ => Ok(1),
        }
    }

    fn execute_batch(&mut self, sql: &str) -> Result<(), PoolError> {
        self.execute(sql).map(|_| ())
    }

    fn query(&mut self, statement: &str) -> Result<Vec<Row>, PoolError> {
        self.execute(statement)?;
        Ok(vec![vec![Value::Text(statement.to_string())]])
    }

    fn begin(&mut self) -> Result<(), PoolError> {
        self.calls.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), PoolError> {
        self.calls.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), PoolError> {
        self.calls.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.calls.fail_rollback.load(Ordering::SeqCst) {
            return Err(PoolError::driver(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "rollback could not reach the server",
            )));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), PoolError> {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn config(min_threads: usize, max_threads: usize) -> PoolConfig {
    PoolConfig {
        min_threads,
        max_threads,
        idle_timeout_ms: 200,
        thread_name: "it".to_string(),
        ..PoolConfig::default()
    }
}
