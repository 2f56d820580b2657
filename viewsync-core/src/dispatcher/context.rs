/*
    context.rs - Owner-thread side of the dispatcher

    The context lives on the owner thread only (it is neither Send nor
    Sync). It owns the dispatcher state, the current floor level and the
    table of suspended waits.

    suspend() does not block the thread: it raises the floor and re-enters
    the dispatch loop, so units at or above the floor keep running while
    the caller waits. One of those units resumes or cancels the wait.
*/

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

use super::queue::{PendingUnit, Work};
use super::{
    DispatchError, DispatchResult, DispatcherHandle, Level, Shared, SuspendId, UnitFailure,
    EVENT_LEVEL_DEFAULT,
};
use crate::metrics::{record_counter, Timer, SUSPEND_DURATION_MS, UNITS_EXECUTED, UNITS_FAILED};

thread_local! {
    static CURRENT: RefCell<Option<Rc<dyn Any>>> = const { RefCell::new(None) };
}

/// Make `context` reachable from handles used on this thread
pub(crate) fn install<S: 'static>(context: &Rc<DispatchContext<S>>) {
    let any: Rc<dyn Any> = context.clone();
    CURRENT.with(|current| *current.borrow_mut() = Some(any));
}

pub(crate) fn uninstall() {
    CURRENT.with(|current| current.borrow_mut().take());
}

/// Context of the dispatcher owning `shared`, if this is its thread
pub(crate) fn current<S: 'static>(shared: &Arc<Shared<S>>) -> Option<Rc<DispatchContext<S>>> {
    let any = CURRENT.with(|current| current.borrow().clone())?;
    let context = any.downcast::<DispatchContext<S>>().ok()?;
    Arc::ptr_eq(&context.handle.shared, shared).then_some(context)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WaitState {
    Waiting,
    Resumed,
    Cancelled(String),
}

#[derive(Debug)]
enum PumpExit {
    Resumed,
    Cancelled(String),
    TimedOut,
    ShutDown,
}

/// Restores the floor when a suspension ends, whatever the outcome
struct FloorGuard<'a> {
    floor: &'a Cell<Level>,
    previous: Level,
}

impl<'a> FloorGuard<'a> {
    fn raise(floor: &'a Cell<Level>, level: Level) -> Self {
        let previous = floor.get();
        floor.set(previous.max(level));
        Self { floor, previous }
    }
}

impl Drop for FloorGuard<'_> {
    fn drop(&mut self) {
        self.floor.set(self.previous);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct DispatchContext<S> {
    handle: DispatcherHandle<S>,
    state: RefCell<S>,
    floor: Cell<Level>,
    current_unit: Cell<Option<u64>>,
    waits: RefCell<HashMap<SuspendId, WaitState>>,
    next_suspend_id: Cell<SuspendId>,
}

impl<S: 'static> DispatchContext<S> {
    pub(crate) fn new(handle: DispatcherHandle<S>, state: S) -> Self {
        Self {
            handle,
            state: RefCell::new(state),
            floor: Cell::new(EVENT_LEVEL_DEFAULT),
            current_unit: Cell::new(None),
            waits: RefCell::new(HashMap::new()),
            next_suspend_id: Cell::new(1),
        }
    }

    pub fn handle(&self) -> &DispatcherHandle<S> {
        &self.handle
    }

    /// Run `f` with exclusive access to the dispatcher state
    ///
    /// Fails with `StateBusy` when a unit further up the stack (one that
    /// submitted inline or is suspended) still holds the state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut S) -> R) -> DispatchResult<R> {
        let mut state = self
            .state
            .try_borrow_mut()
            .map_err(|_| DispatchError::StateBusy)?;
        Ok(f(&mut state))
    }

    pub fn current_floor(&self) -> Level {
        self.floor.get()
    }

    /// Id of the unit currently executing
    pub fn current_unit(&self) -> Option<u64> {
        self.current_unit.get()
    }

    /// Fresh id for a call to [`Self::suspend`]
    pub fn next_suspend_id(&self) -> SuspendId {
        let id = self.next_suspend_id.get();
        self.next_suspend_id.set(id + 1);
        id
    }

    pub fn is_waiting(&self, id: SuspendId) -> bool {
        self.waits.borrow().get(&id) == Some(&WaitState::Waiting)
    }

    /// Run `unit` right away if `level` reaches the current floor,
    /// otherwise queue it behind its siblings
    pub fn submit<F>(&self, level: Level, unit: F) -> DispatchResult<()>
    where
        F: FnOnce(&DispatchContext<S>) -> anyhow::Result<()> + Send + 'static,
    {
        self.submit_boxed(level, Box::new(unit))
    }

    pub(crate) fn submit_boxed(&self, level: Level, work: Work<S>) -> DispatchResult<()> {
        let shared = &self.handle.shared;
        let spawned_by = self.current_unit.get();
        if level < self.floor.get() {
            return shared.enqueue(level, spawned_by, work).map(|_| ());
        }
        if shared.is_exiting() {
            return Err(DispatchError::ShutDown);
        }
        let unit = PendingUnit {
            id: shared.next_unit_id(),
            level,
            spawned_by,
            work,
        };
        trace!(unit = unit.id, level, "executing inline");
        self.execute(unit, true);
        Ok(())
    }

    /// Wait until `id` is resumed, cancelled or times out
    ///
    /// The floor is raised to at least `floor` for the duration and
    /// restored afterwards. `None` uses the configured default timeout.
    pub fn suspend(&self, id: SuspendId, floor: Level, timeout: Option<Duration>) -> DispatchResult<()> {
        if self.waits.borrow().contains_key(&id) {
            return Err(DispatchError::AlreadySuspended(id));
        }
        self.waits.borrow_mut().insert(id, WaitState::Waiting);

        let shared = &self.handle.shared;
        let after = timeout.unwrap_or(shared.config.default_suspend_timeout);
        let deadline = Instant::now() + after;
        let _floor = FloorGuard::raise(&self.floor, floor);
        shared.stats.inc_suspensions();
        debug!(id, floor = self.floor.get(), ?after, "suspending");

        let timer = Timer::new(SUSPEND_DURATION_MS);
        let exit = self.pump(Some(id), Some(deadline));
        self.waits.borrow_mut().remove(&id);
        let waited_ms = timer.stop();
        debug!(id, ?exit, waited_ms, "suspension ended");

        match exit {
            PumpExit::Resumed => Ok(()),
            PumpExit::Cancelled(reason) => Err(DispatchError::Cancelled { id, reason }),
            PumpExit::TimedOut => {
                shared.stats.inc_timed_out();
                warn!(id, ?after, "suspension timed out");
                Err(DispatchError::TimedOut { id, after })
            }
            PumpExit::ShutDown => Err(DispatchError::ShutDown),
        }
    }

    /// Let the suspension `id` return normally; false if nothing waits on it
    pub fn resume(&self, id: SuspendId) -> bool {
        self.finish_wait(id, WaitState::Resumed)
    }

    /// Make the suspension `id` fail with `Cancelled(reason)`
    pub fn cancel(&self, id: SuspendId, reason: impl Into<String>) -> bool {
        self.finish_wait(id, WaitState::Cancelled(reason.into()))
    }

    fn finish_wait(&self, id: SuspendId, outcome: WaitState) -> bool {
        let mut waits = self.waits.borrow_mut();
        match waits.get_mut(&id) {
            Some(state) if *state == WaitState::Waiting => {
                debug!(id, ?outcome, "wait finished");
                *state = outcome;
                true
            }
            _ => {
                warn!(id, ?outcome, "no suspension waiting on this id");
                false
            }
        }
    }

    /// Top-level loop; returns once the dispatcher shuts down
    pub(crate) fn run(&self) {
        let exit = self.pump(None, None);
        debug!(?exit, "dispatch loop left");
    }

    fn wait_state(&self, id: SuspendId) -> Option<WaitState> {
        self.waits.borrow().get(&id).cloned()
    }

    fn pump(&self, wait: Option<SuspendId>, deadline: Option<Instant>) -> PumpExit {
        let shared = &self.handle.shared;
        loop {
            if let Some(id) = wait {
                match self.wait_state(id) {
                    Some(WaitState::Resumed) => return PumpExit::Resumed,
                    Some(WaitState::Cancelled(reason)) => return PumpExit::Cancelled(reason),
                    _ => {}
                }
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return PumpExit::TimedOut;
            }

            let unit = {
                let mut queue = shared.lock();
                loop {
                    if queue.exit {
                        return PumpExit::ShutDown;
                    }
                    if let Some(unit) = queue.take_eligible(self.floor.get()) {
                        break unit;
                    }
                    let wait_for = match deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                return PumpExit::TimedOut;
                            }
                            remaining
                        }
                        None => shared.config.idle_wait,
                    };
                    queue = shared.wait(queue, wait_for);
                }
            };
            self.execute(unit, false);
        }
    }

    fn execute(&self, unit: PendingUnit<S>, inline: bool) {
        let PendingUnit { id, level, work, .. } = unit;
        let previous = self.current_unit.replace(Some(id));
        trace!(unit = id, level, inline, "unit started");

        let result = panic::catch_unwind(AssertUnwindSafe(|| work(self)));
        self.current_unit.set(previous);

        let shared = &self.handle.shared;
        shared.stats.inc_executed(inline);
        record_counter(UNITS_EXECUTED, 1);

        let failure = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => UnitFailure {
                unit_id: id,
                level,
                message: format!("{:#}", err),
                panicked: false,
            },
            Err(payload) => UnitFailure {
                unit_id: id,
                level,
                message: panic_message(&*payload),
                panicked: true,
            },
        };

        shared.stats.inc_failed();
        record_counter(UNITS_FAILED, 1);
        error!(
            unit = id,
            level,
            panicked = failure.panicked,
            error = %failure.message,
            "work unit failed"
        );

        if let Some(hook) = &shared.failure_hook {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(&failure))) {
                error!(
                    unit = id,
                    error = %panic_message(&*payload),
                    "failure handler panicked"
                );
            }
        }
    }
}
