//! Bounded pool of blocking worker threads.
//!
//! Workers pull boxed jobs from one shared queue. The pool keeps `min`
//! workers alive while running and grows up to `max` when every live worker
//! is busy; surplus workers exit after `idle_timeout` without work.

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::id::{WorkerId, WorkerIdGenerator};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs on a worker thread right before it exits.
pub type ExitHook = Arc<dyn Fn(WorkerId) + Send + Sync + 'static>;

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Identity of the worker running on the current thread, if any.
pub fn current_worker() -> Option<WorkerId> {
    CURRENT_WORKER.with(Cell::get)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerPoolSnapshot {
    pub live: usize,
    pub idle: usize,
    pub queued: usize,
    pub min: usize,
    pub max: usize,
}

struct QueueState {
    jobs: VecDeque<Job>,
    live: usize,
    idle: usize,
    started: bool,
    stopping: bool,
    handles: Vec<(WorkerId, JoinHandle<()>)>,
    /// Live-worker count at which spawning fails, to exercise spawn errors.
    #[cfg(test)]
    spawn_limit: Option<usize>,
}

struct Shared {
    name: String,
    min: usize,
    max: usize,
    idle_timeout: Duration,
    state: Mutex<QueueState>,
    condvar: Condvar,
    worker_ids: WorkerIdGenerator,
    on_exit: Option<ExitHook>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(
        name: &str,
        min: usize,
        max: usize,
        idle_timeout: Duration,
    ) -> Result<Self, PoolError> {
        Self::build(name, min, max, idle_timeout, None)
    }

    /// Like [`WorkerPool::new`], with `hook` run on each worker thread as it
    /// exits, whether it shrinks away or is stopped.
    pub fn with_exit_hook<F>(
        name: &str,
        min: usize,
        max: usize,
        idle_timeout: Duration,
        hook: F,
    ) -> Result<Self, PoolError>
    where
        F: Fn(WorkerId) + Send + Sync + 'static,
    {
        Self::build(name, min, max, idle_timeout, Some(Arc::new(hook)))
    }

    fn build(
        name: &str,
        min: usize,
        max: usize,
        idle_timeout: Duration,
        on_exit: Option<ExitHook>,
    ) -> Result<Self, PoolError> {
        if max == 0 {
            return Err(PoolError::Config(
                "worker pool max must be greater than 0".to_string(),
            ));
        }
        if min > max {
            return Err(PoolError::Config(format!(
                "worker pool min ({min}) exceeds max ({max})"
            )));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                min,
                max,
                idle_timeout,
                state: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    live: 0,
                    idle: 0,
                    started: false,
                    stopping: false,
                    handles: Vec::new(),
                    #[cfg(test)]
                    spawn_limit: None,
                }),
                condvar: Condvar::new(),
                worker_ids: WorkerIdGenerator::new(),
                on_exit,
            }),
        })
    }

    /// Spawn the persistent workers. Calling `start` on a running pool does
    /// nothing; a stopped pool cannot be restarted.
    ///
    /// When a spawn fails the pool stays unstarted; workers already spawned
    /// keep serving the queue and a later `start` tops them up.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut state = self.shared.lock();
        if state.stopping {
            return Err(PoolError::PoolClosed);
        }
        if state.started {
            return Ok(());
        }

        let initial = self.shared.min.max(state.jobs.len().min(self.shared.max));
        while state.live < initial {
            self.spawn_worker(&mut state)?;
        }
        state.started = true;
        info!(
            pool = %self.shared.name,
            min = self.shared.min,
            max = self.shared.max,
            workers = state.live,
            "worker pool started"
        );
        Ok(())
    }

    /// Queue `job` and return immediately.
    ///
    /// Before `start` the job waits in the queue. Fails with `PoolClosed`
    /// once `stop` has been called.
    pub fn submit(&self, job: Job) -> Result<(), PoolError> {
        let mut state = self.shared.lock();
        if state.stopping {
            return Err(PoolError::PoolClosed);
        }
        state.jobs.push_back(job);

        if state.started && state.jobs.len() > state.idle && state.live < self.shared.max {
            if let Err(err) = self.spawn_worker(&mut state) {
                if state.live == 0 {
                    state.jobs.pop_back();
                    return Err(err);
                }
                warn!(pool = %self.shared.name, error = %err, "could not grow worker pool");
            }
        }
        self.shared.condvar.notify_one();
        Ok(())
    }

    /// Stop accepting work, let the workers finish what is queued, then join
    /// them. The calling thread is never joined, so a job may stop its own
    /// pool.
    pub fn stop(&self) {
        let (handles, dropped) = {
            let mut state = self.shared.lock();
            state.stopping = true;
            let dropped = if state.live == 0 {
                std::mem::take(&mut state.jobs)
            } else {
                VecDeque::new()
            };
            (std::mem::take(&mut state.handles), dropped)
        };
        self.shared.condvar.notify_all();

        if !dropped.is_empty() {
            debug!(pool = %self.shared.name, jobs = dropped.len(), "dropping jobs of a pool that never ran");
        }
        drop(dropped);

        let current = thread::current().id();
        let mut joined = 0usize;
        for (worker_id, handle) in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.shared.name, worker_id = %worker_id, "worker thread panicked");
            }
            joined += 1;
        }
        if joined > 0 {
            info!(pool = %self.shared.name, joined, "worker pool stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        let state = self.shared.lock();
        state.started && !state.stopping
    }

    pub fn snapshot(&self) -> WorkerPoolSnapshot {
        let state = self.shared.lock();
        WorkerPoolSnapshot {
            live: state.live,
            idle: state.idle,
            queued: state.jobs.len(),
            min: self.shared.min,
            max: self.shared.max,
        }
    }

    fn spawn_worker(&self, state: &mut QueueState) -> Result<(), PoolError> {
        state.handles.retain(|(_, handle)| !handle.is_finished());
        #[cfg(test)]
        {
            if state.spawn_limit.is_some_and(|limit| state.live >= limit) {
                return Err(
                    std::io::Error::new(std::io::ErrorKind::WouldBlock, "spawn limit reached")
                        .into(),
                );
            }
        }

        let worker_id = self.shared.worker_ids.next();
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{}", self.shared.name, worker_id))
            .spawn(move || worker_loop(shared, worker_id))?;
        state.live += 1;
        state.handles.push((worker_id, handle));
        debug!(pool = %self.shared.name, worker_id = %worker_id, live = state.live, "spawned worker");
        Ok(())
    }
}

fn worker_loop(shared: Arc<Shared>, worker_id: WorkerId) {
    CURRENT_WORKER.with(|current| current.set(Some(worker_id)));

    let mut state = shared.lock();
    loop {
        if let Some(job) = state.jobs.pop_front() {
            drop(state);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                error!(
                    pool = %shared.name,
                    worker_id = %worker_id,
                    panic = %panic_message(payload.as_ref()),
                    "job panicked"
                );
            }
            state = shared.lock();
            continue;
        }
        if state.stopping {
            break;
        }

        state.idle += 1;
        let (guard, wait) = shared
            .condvar
            .wait_timeout(state, shared.idle_timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state = guard;
        state.idle -= 1;

        if wait.timed_out()
            && state.jobs.is_empty()
            && !state.stopping
            && state.live > shared.min
        {
            break;
        }
    }
    state.live -= 1;
    debug!(pool = %shared.name, worker_id = %worker_id, live = state.live, "worker exiting");
    drop(state);

    if let Some(hook) = &shared.on_exit {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(worker_id))) {
            error!(
                pool = %shared.name,
                worker_id = %worker_id,
                panic = %panic_message(payload.as_ref()),
                "worker exit hook panicked"
            );
        }
    }
}

/// Render a panic payload the way the default hook does.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Barrier;
    use std::time::Instant;

    fn pool(min: usize, max: usize) -> WorkerPool {
        WorkerPool::new("test", min, max, Duration::from_millis(50)).unwrap()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn rejects_invalid_bounds() {
        assert!(WorkerPool::new("p", 0, 0, Duration::ZERO).is_err());
        assert!(WorkerPool::new("p", 3, 2, Duration::ZERO).is_err());
    }

    #[test]
    fn start_spawns_min_workers_and_is_idempotent() {
        let pool = pool(2, 4);
        assert_eq!(pool.snapshot().live, 0);
        pool.start().unwrap();
        pool.start().unwrap();
        assert_eq!(pool.snapshot().live, 2);
        pool.stop();
        assert_eq!(pool.snapshot().live, 0);
    }

    #[test]
    fn failed_spawn_leaves_the_pool_unstarted_until_a_retry_fills_min() {
        let pool = pool(3, 4);
        pool.shared.lock().spawn_limit = Some(1);

        assert!(matches!(pool.start(), Err(PoolError::Io(_))));
        assert!(!pool.is_started());
        assert_eq!(pool.snapshot().live, 1);

        pool.shared.lock().spawn_limit = None;
        pool.start().unwrap();
        assert!(pool.is_started());
        assert_eq!(pool.snapshot().live, 3);
        pool.stop();
    }

    #[test]
    fn jobs_run_on_named_worker_threads() {
        let pool = pool(1, 1);
        pool.start().unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send((name, current_worker())).unwrap();
        }))
        .unwrap();

        let (name, worker) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-worker-1"));
        assert_eq!(worker, Some(WorkerId::new(1)));
        assert_eq!(current_worker(), None);
        pool.stop();
    }

    #[test]
    fn grows_under_load_but_never_past_max() {
        let pool = pool(1, 3);
        pool.start().unwrap();
        let barrier = Arc::new(Barrier::new(4));
        for _ in 0..3 {
            let barrier = barrier.clone();
            pool.submit(Box::new(move || {
                barrier.wait();
            }))
            .unwrap();
        }
        for _ in 0..5 {
            pool.submit(Box::new(|| {})).unwrap();
        }
        assert_eq!(pool.snapshot().live, 3);
        barrier.wait();
        pool.stop();
    }

    #[test]
    fn surplus_workers_shrink_back_to_min() {
        let pool = pool(1, 3);
        pool.start().unwrap();
        let barrier = Arc::new(Barrier::new(4));
        for _ in 0..3 {
            let barrier = barrier.clone();
            pool.submit(Box::new(move || {
                barrier.wait();
            }))
            .unwrap();
        }
        barrier.wait();
        assert!(wait_for(|| pool.snapshot().live == 1));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(pool.snapshot().live, 1);
        pool.stop();
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let pool = pool(1, 1);
        pool.start().unwrap();
        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || tx.send(current_worker()).unwrap()))
            .unwrap();

        let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(worker, Some(WorkerId::new(1)));
        assert_eq!(pool.snapshot().live, 1);
        pool.stop();
    }

    #[test]
    fn jobs_submitted_before_start_run_once_started() {
        let pool = pool(0, 2);
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(pool.snapshot().queued, 1);
        assert!(rx.try_recv().is_err());

        pool.start().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        pool.stop();
    }

    #[test]
    fn stop_drains_queued_jobs_before_joining() {
        let pool = pool(1, 1);
        pool.start().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let ran = ran.clone();
            pool.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(1));
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.stop();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert_eq!(pool.snapshot().live, 0);
    }

    #[test]
    fn stopping_a_never_started_pool_drops_its_jobs() {
        struct Dropped(mpsc::Sender<&'static str>);
        impl Drop for Dropped {
            fn drop(&mut self) {
                let _ = self.0.send("dropped");
            }
        }

        let pool = pool(1, 1);
        let (tx, rx) = mpsc::channel();
        let guard = Dropped(tx.clone());
        pool.submit(Box::new(move || {
            let _guard = guard;
            tx.send("ran").unwrap();
        }))
        .unwrap();
        pool.stop();

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "dropped");
        assert!(rx.try_recv().is_err());
        assert!(matches!(pool.start(), Err(PoolError::PoolClosed)));
    }

    #[test]
    fn submit_after_stop_fails() {
        let pool = pool(1, 1);
        pool.start().unwrap();
        pool.stop();
        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(PoolError::PoolClosed)
        ));
        assert!(!pool.is_started());
    }

    #[test]
    fn a_job_may_stop_its_own_pool() {
        let pool = pool(1, 1);
        pool.start().unwrap();
        let (tx, rx) = mpsc::channel();
        let inner = pool.clone();
        pool.submit(Box::new(move || {
            inner.stop();
            tx.send(()).unwrap();
        }))
        .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(wait_for(|| pool.snapshot().live == 0));
        pool.stop();
    }

    #[test]
    fn exit_hook_runs_on_every_worker_thread() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pool = WorkerPool::with_exit_hook("hooked", 2, 2, Duration::from_millis(50), move |id| {
            let name = thread::current().name().map(str::to_string);
            let _ = tx.lock().unwrap().send((id, name));
        })
        .unwrap();
        pool.start().unwrap();
        pool.stop();

        let mut exits: Vec<_> = rx.try_iter().collect();
        exits.sort();
        assert_eq!(
            exits,
            vec![
                (WorkerId::new(1), Some("hooked-worker-1".to_string())),
                (WorkerId::new(2), Some("hooked-worker-2".to_string())),
            ]
        );
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload = panic::catch_unwind(|| panic!("{}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "42");
    }
}
