//! Single-threaded event loop with startup/shutdown triggers.
//!
//! `Reactor::run` drives one future on a current-thread tokio runtime. Hooks
//! registered for the startup event fire before the future is first polled,
//! shutdown hooks fire after it completes. Both run on the event-loop thread.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::LocalSet;
use tracing::{debug, info};

use crate::error::PoolError;
use crate::id::{TriggerId, TriggerIdGenerator};

type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Ordering slot of a trigger within one system event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Before,
    During,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    Startup,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

struct Trigger {
    id: TriggerId,
    phase: Phase,
    event: SystemEvent,
    hook: Hook,
}

struct ReactorState {
    run_state: RunState,
    triggers: Vec<Trigger>,
}

struct ReactorInner {
    state: Mutex<ReactorState>,
    ids: TriggerIdGenerator,
}

/// Handle to the event loop. Clones share the same loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ReactorInner {
                state: Mutex::new(ReactorState {
                    run_state: RunState::Idle,
                    triggers: Vec::new(),
                }),
                ids: TriggerIdGenerator::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReactorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state().run_state == RunState::Running
    }

    pub fn has_stopped(&self) -> bool {
        self.state().run_state == RunState::Stopped
    }

    /// Run `hook` once the loop is running.
    ///
    /// When the loop is already running the hook is invoked right away and
    /// `None` is returned; otherwise the returned id can be passed to
    /// [`Reactor::remove_system_event_trigger`]. A stopped reactor never
    /// runs again, so the hook is refused with [`PoolError::Reactor`].
    pub fn call_when_running<F>(&self, hook: F) -> Result<Option<TriggerId>, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state();
        match state.run_state {
            RunState::Running => {
                drop(state);
                hook();
                return Ok(None);
            }
            RunState::Stopped => {
                return Err(PoolError::Reactor("reactor has already stopped".to_string()))
            }
            RunState::Idle => {}
        }
        Ok(Some(Self::push_trigger(
            &self.inner.ids,
            &mut state,
            Phase::After,
            SystemEvent::Startup,
            Box::new(hook),
        )))
    }

    pub fn add_system_event_trigger<F>(
        &self,
        phase: Phase,
        event: SystemEvent,
        hook: F,
    ) -> TriggerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state();
        Self::push_trigger(&self.inner.ids, &mut state, phase, event, Box::new(hook))
    }

    fn push_trigger(
        ids: &TriggerIdGenerator,
        state: &mut ReactorState,
        phase: Phase,
        event: SystemEvent,
        hook: Hook,
    ) -> TriggerId {
        let id = ids.next();
        state.triggers.push(Trigger {
            id,
            phase,
            event,
            hook,
        });
        debug!(trigger_id = %id, ?phase, ?event, "registered system event trigger");
        id
    }

    /// Remove a pending trigger. Returns false when it already fired or
    /// was never registered.
    pub fn remove_system_event_trigger(&self, id: TriggerId) -> bool {
        let mut state = self.state();
        let before = state.triggers.len();
        state.triggers.retain(|trigger| trigger.id != id);
        before != state.triggers.len()
    }

    /// Drive `future` to completion on the event-loop thread.
    ///
    /// A reactor runs once; calling `run` again, or from inside a running
    /// loop, fails with [`PoolError::Reactor`].
    pub fn run<F>(&self, future: F) -> Result<F::Output, PoolError>
    where
        F: Future,
    {
        {
            let mut state = self.state();
            match state.run_state {
                RunState::Running => {
                    return Err(PoolError::Reactor("reactor is already running".to_string()))
                }
                RunState::Stopped => {
                    return Err(PoolError::Reactor("reactor cannot be restarted".to_string()))
                }
                RunState::Idle => {}
            }
            state.run_state = RunState::Running;
        }

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                self.state().run_state = RunState::Idle;
                return Err(PoolError::Io(err));
            }
        };
        let local = LocalSet::new();

        info!("reactor running");
        let output = local.block_on(&runtime, async {
            self.fire(SystemEvent::Startup);
            let output = future.await;
            self.state().run_state = RunState::Stopped;
            info!("reactor shutting down");
            self.fire(SystemEvent::Shutdown);
            output
        });
        Ok(output)
    }

    /// Fire every trigger registered for `event`, phase by phase.
    ///
    /// Triggers are taken out of the registry before they run, so hooks may
    /// register or remove other triggers.
    fn fire(&self, event: SystemEvent) {
        for phase in [Phase::Before, Phase::During, Phase::After] {
            loop {
                let next = {
                    let mut state = self.state();
                    state
                        .triggers
                        .iter()
                        .position(|t| t.event == event && t.phase == phase)
                        .map(|idx| state.triggers.remove(idx))
                };
                match next {
                    Some(trigger) => {
                        debug!(trigger_id = %trigger.id, ?phase, ?event, "firing trigger");
                        (trigger.hook)();
                    }
                    None => break,
                }
            }
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}
