//! Connection pool facade.
//!
//! `ConnectionPool` owns the worker threads, the engine and the per-thread
//! connection cache. Work is dispatched onto the workers and its outcome is
//! handed back through a [`CompletionHandle`] that the event loop awaits.
//!
//! Lifecycle: construction defers `start` until the reactor runs; `start`
//! registers a shutdown trigger that tears the pool down when the reactor
//! stops. `close` removes whichever triggers are still pending and runs the
//! same teardown.

pub mod cache;
pub mod connection;
pub mod handle;
pub mod operation;

pub use cache::{CachedConnection, ConnectionCache};
pub use connection::PooledConnection;
pub use handle::{Completer, CompletionHandle};
pub use operation::{Operation, OperationOutput};

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PoolConfig;
use crate::engine::{DuckDbEngine, Engine};
use crate::error::PoolError;
use crate::id::{ConnectionId, TriggerId, WorkerId};
use crate::metrics::{MetricsSnapshot, PoolMetrics};
use crate::reactor::{Phase, Reactor, SystemEvent};
use crate::threadpool::{panic_message, WorkerPool, WorkerPoolSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Constructed; `start` runs once the reactor is running.
    AwaitingReactor,
    Running,
    /// Torn down. A stopped pool never restarts.
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub state: LifecycleState,
    pub database_url: String,
    pub workers: WorkerPoolSnapshot,
    pub cached_connections: usize,
    pub metrics: MetricsSnapshot,
}

/// State shared with the worker threads.
pub(crate) struct PoolShared<E: Engine> {
    engine: E,
    cache: ConnectionCache<E::Connection>,
    metrics: PoolMetrics,
}

impl<E: Engine> PoolShared<E> {
    pub(crate) fn new(engine: E) -> Self {
        Self {
            engine,
            cache: ConnectionCache::new(),
            metrics: PoolMetrics::default(),
        }
    }

    /// Close and evict one cached connection. A close error is logged; the
    /// entry is gone either way.
    pub(crate) fn disconnect(&self, id: ConnectionId, reason: &'static str) {
        match self.cache.disconnect(id) {
            Ok(true) => {
                self.metrics.record_connection_closed();
                debug!(connection_id = %id, reason, "disconnected connection");
            }
            Ok(false) => {}
            Err(err) => {
                self.metrics.record_connection_closed();
                warn!(connection_id = %id, reason, error = %err, "error closing connection");
            }
        }
    }

    /// Release the calling worker thread's connection as the thread exits.
    fn release_current_thread(&self, worker_id: WorkerId) {
        if let Some(entry) = self.cache.connection_for(thread::current().id()) {
            let id = entry.id();
            drop(entry);
            debug!(worker_id = %worker_id, connection_id = %id, "worker exiting with cached connection");
            self.disconnect(id, "worker exit");
        }
    }
}

struct Lifecycle {
    state: LifecycleState,
    start_trigger: Option<TriggerId>,
    shutdown_trigger: Option<TriggerId>,
}

struct PoolInner<E: Engine> {
    shared: Arc<PoolShared<E>>,
    workers: WorkerPool,
    reactor: Reactor,
    lifecycle: Mutex<Lifecycle>,
}

/// Asynchronous facade over a blocking database engine.
///
/// Cloning is cheap; clones share one pool. Dropping the last clone closes
/// the pool.
pub struct ConnectionPool<E: Engine = DuckDbEngine> {
    inner: Arc<PoolInner<E>>,
}

impl<E: Engine> Clone for ConnectionPool<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ConnectionPool<DuckDbEngine> {
    /// Build a pool over the DuckDB database named by `config.database_url`.
    /// The database is not opened until the first connection is needed.
    pub fn open(reactor: &Reactor, config: &PoolConfig) -> Result<Self, PoolError> {
        let engine = DuckDbEngine::from_config(config)?;
        Self::new(reactor, engine, config)
    }
}

impl<E: Engine> ConnectionPool<E> {
    /// Create a pool and schedule its start for when `reactor` runs.
    ///
    /// No threads are spawned and no connection is opened here. Fails with
    /// [`PoolError::Reactor`] when `reactor` has already stopped.
    pub fn new(reactor: &Reactor, engine: E, config: &PoolConfig) -> Result<Self, PoolError> {
        if reactor.has_stopped() {
            return Err(PoolError::Reactor("reactor has already stopped".to_string()));
        }
        let shared = Arc::new(PoolShared::new(engine));
        let workers = WorkerPool::with_exit_hook(
            &config.thread_name,
            config.min_threads,
            config.max_threads,
            config.idle_timeout(),
            {
                let shared = shared.clone();
                move |worker_id| shared.release_current_thread(worker_id)
            },
        )?;
        let inner = Arc::new(PoolInner {
            shared,
            workers,
            reactor: reactor.clone(),
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::AwaitingReactor,
                start_trigger: None,
                shutdown_trigger: None,
            }),
        });

        let weak = Arc::downgrade(&inner);
        let trigger = reactor.call_when_running(move || {
            if let Some(inner) = weak.upgrade() {
                if let Err(err) = inner.start() {
                    warn!(error = %err, "deferred pool start failed");
                }
            }
        })?;
        if let Some(id) = trigger {
            let mut lifecycle = inner.lifecycle();
            if lifecycle.state == LifecycleState::AwaitingReactor {
                lifecycle.start_trigger = Some(id);
            }
        }

        Ok(Self { inner })
    }

    /// Start the worker threads. Idempotent while running; fails with
    /// `PoolClosed` once the pool has stopped.
    pub fn start(&self) -> Result<(), PoolError> {
        self.inner.start()
    }

    /// Tear the pool down: deregister pending triggers, stop the workers and
    /// close every cached connection. Safe to call more than once and
    /// before the reactor ever ran.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn engine(&self) -> &E {
        &self.inner.shared.engine
    }

    pub fn cached_connections(&self) -> usize {
        self.inner.shared.cache.len()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            state: self.state(),
            database_url: self.inner.shared.engine.url().to_string(),
            workers: self.inner.workers.snapshot(),
            cached_connections: self.cached_connections(),
            metrics: self.inner.shared.metrics.snapshot(),
        }
    }

    /// Run `f` with the engine on a worker thread.
    pub fn run_with_engine<T, F>(&self, f: F) -> CompletionHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&E) -> Result<T, PoolError> + Send + 'static,
    {
        self.dispatch("run_with_engine", move |shared| f(&shared.engine))
    }

    /// Run one operation on the worker thread's cached connection.
    ///
    /// On failure the connection is rolled back before the original error
    /// is delivered.
    pub fn run_with_connection(&self, operation: Operation) -> CompletionHandle<OperationOutput> {
        self.dispatch(operation.name(), move |shared| {
            let mut conn = PooledConnection::new(shared)?;
            conn.invoke(&operation).inspect_err(|err| conn.abort(err))
        })
    }

    /// Run `f` inside a transaction on a worker thread's connection.
    ///
    /// Commits when `f` succeeds; otherwise rolls back and delivers the
    /// original error.
    pub fn run_interaction<T, F>(&self, f: F) -> CompletionHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PooledConnection<'_, E>) -> Result<T, PoolError> + Send + 'static,
    {
        self.dispatch("run_interaction", move |shared| {
            let mut conn = PooledConnection::new(shared)?;
            transact(&mut conn, f).inspect_err(|err| conn.abort(err))
        })
    }

    fn dispatch<T, F>(&self, context: &'static str, work: F) -> CompletionHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&PoolShared<E>) -> Result<T, PoolError> + Send + 'static,
    {
        if self.state() == LifecycleState::Stopped {
            return CompletionHandle::resolved(Err(PoolError::PoolClosed));
        }

        let (completer, handle) = CompletionHandle::channel();
        let shared = self.inner.shared.clone();
        let job = Box::new(move || {
            let _in_flight = shared.metrics.start_task();
            let result = match panic::catch_unwind(AssertUnwindSafe(|| work(shared.as_ref()))) {
                Ok(Ok(value)) => {
                    shared.metrics.record_success();
                    Ok(value)
                }
                Ok(Err(err)) => {
                    shared.metrics.record_failure(context, err.to_string());
                    Err(err)
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(operation = context, panic = %message, "unit of work panicked");
                    shared.metrics.record_panic(context, message.clone());
                    Err(PoolError::TaskPanicked(message))
                }
            };
            completer.complete(result);
        });

        match self.inner.workers.submit(job) {
            Ok(()) => handle,
            Err(err) => CompletionHandle::resolved(Err(err)),
        }
    }
}

fn transact<E, T, F>(conn: &mut PooledConnection<'_, E>, f: F) -> Result<T, PoolError>
where
    E: Engine,
    F: FnOnce(&mut PooledConnection<'_, E>) -> Result<T, PoolError>,
{
    conn.begin()?;
    let value = f(&mut *conn)?;
    conn.commit()?;
    Ok(value)
}

impl<E: Engine> PoolInner<E> {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[instrument(skip(self), fields(url = %self.shared.engine.url()))]
    fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Stopped => return Err(PoolError::PoolClosed),
            LifecycleState::AwaitingReactor => {}
        }

        self.workers.start()?;
        let weak: Weak<Self> = Arc::downgrade(self);
        lifecycle.shutdown_trigger = Some(self.reactor.add_system_event_trigger(
            Phase::During,
            SystemEvent::Shutdown,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.final_close();
                }
            },
        ));
        lifecycle.start_trigger = None;
        lifecycle.state = LifecycleState::Running;

        let workers = self.workers.snapshot();
        info!(
            min_threads = workers.min,
            max_threads = workers.max,
            "connection pool started"
        );
        Ok(())
    }

    fn close(&self) {
        let (start_trigger, shutdown_trigger) = {
            let mut lifecycle = self.lifecycle();
            (
                lifecycle.start_trigger.take(),
                lifecycle.shutdown_trigger.take(),
            )
        };
        for id in [start_trigger, shutdown_trigger].into_iter().flatten() {
            self.reactor.remove_system_event_trigger(id);
        }
        self.final_close();
    }

    /// Teardown shared by `close` and the reactor's shutdown trigger. Only
    /// the first call does any work.
    fn final_close(&self) {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == LifecycleState::Stopped {
                return;
            }
            lifecycle.state = LifecycleState::Stopped;
            lifecycle.start_trigger = None;
            lifecycle.shutdown_trigger = None;
        }

        // Workers release their own connections as they exit; the drain
        // picks up whatever is left.
        self.workers.stop();
        let drained = self.shared.cache.drain();
        for _ in 0..drained {
            self.shared.metrics.record_connection_closed();
        }
        info!(
            url = %self.shared.engine.url(),
            drained,
            connections_closed = self.shared.metrics.snapshot().connections_closed,
            "connection pool closed"
        );
    }
}

impl<E: Engine> Drop for PoolInner<E> {
    fn drop(&mut self) {
        self.close();
    }
}
