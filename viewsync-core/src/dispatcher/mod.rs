/*
    dispatcher - One owner thread executing leveled work units

    Producers on any thread submit units through a DispatcherHandle. The
    owner thread takes the first queued unit whose level reaches the
    current floor and runs it with a DispatchContext, which is the only way
    to reach the dispatcher state.

    Unit lifecycle: queued -> executing -> completed, or executing ->
    suspended -> resumed / cancelled / timed out.

    Failures (errors and panics) are logged and reported to the optional
    failure hook; they never stop the loop.
*/

mod context;
mod error;
mod queue;

pub use context::DispatchContext;
pub use error::{DispatchError, DispatchResult};

use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{error, info, trace, warn};

use crate::config::DispatcherConfig;
use crate::metrics::{record_counter, DispatcherStats, StatsSnapshot, UNITS_CANCELLED};
use queue::{PendingUnit, UnitQueue, Work};

/// Priority of a work unit; higher runs first when a floor is raised
pub type Level = i32;

/// Key of one suspended wait
pub type SuspendId = u64;

pub const EVENT_LEVEL_DEFAULT: Level = 0;

/// Level of round-trip API calls to the peer; a suspended call only lets
/// units at this level or above run
pub const EVENT_LEVEL_SYNC_API_CALL: Level = 500;

/// What the failure hook learns about a failed unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub unit_id: u64,
    pub level: Level,
    pub message: String,
    pub panicked: bool,
}

type FailureHook = Arc<dyn Fn(&UnitFailure) + Send + Sync>;

pub(crate) struct Shared<S> {
    queue: Mutex<UnitQueue<S>>,
    wakeup: Condvar,
    stats: DispatcherStats,
    config: DispatcherConfig,
    owner: OnceLock<ThreadId>,
    next_unit_id: AtomicU64,
    failure_hook: Option<FailureHook>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Shared<S> {
    // units run outside the lock, so a poisoned queue is still consistent
    fn lock(&self) -> MutexGuard<'_, UnitQueue<S>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, UnitQueue<S>>, timeout: Duration) -> MutexGuard<'a, UnitQueue<S>> {
        match self.wakeup.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    fn next_unit_id(&self) -> u64 {
        self.next_unit_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_exiting(&self) -> bool {
        self.lock().exit
    }

    fn is_owner_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    fn enqueue(&self, level: Level, spawned_by: Option<u64>, work: Work<S>) -> DispatchResult<u64> {
        let id = self.next_unit_id();
        let queued = {
            let mut queue = self.lock();
            if queue.exit {
                return Err(DispatchError::ShutDown);
            }
            queue.push(PendingUnit {
                id,
                level,
                spawned_by,
                work,
            });
            queue.len()
        };
        self.wakeup.notify_all();

        trace!(unit = id, level, ?spawned_by, queued, "unit queued");
        if queued == self.config.queue_warn_threshold + 1 {
            warn!(queued, threshold = self.config.queue_warn_threshold, "dispatcher queue is backing up");
        }
        Ok(id)
    }
}

/// Builder for a dispatcher whose owner thread holds state `S`
pub struct EventDispatcher<S> {
    config: DispatcherConfig,
    failure_hook: Option<FailureHook>,
    _state: PhantomData<fn() -> S>,
}

impl<S: 'static> EventDispatcher<S> {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            failure_hook: None,
            _state: PhantomData,
        }
    }

    /// Called on the owner thread for every failed unit
    pub fn on_failure(mut self, hook: impl Fn(&UnitFailure) + Send + Sync + 'static) -> Self {
        self.failure_hook = Some(Arc::new(hook));
        self
    }

    /// Spawn the owner thread; `init` builds the state on that thread
    pub fn start<F>(self, init: F) -> DispatchResult<DispatcherHandle<S>>
    where
        F: FnOnce(&DispatcherHandle<S>) -> S + Send + 'static,
    {
        let thread_name = self.config.thread_name.clone();
        let shared = Arc::new(Shared {
            queue: Mutex::new(UnitQueue::new()),
            wakeup: Condvar::new(),
            stats: DispatcherStats::new(),
            config: self.config,
            owner: OnceLock::new(),
            next_unit_id: AtomicU64::new(1),
            failure_hook: self.failure_hook,
            thread: Mutex::new(None),
        });
        let handle = DispatcherHandle { shared };
        let owner_handle = handle.clone();

        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_owner_thread(owner_handle, init))
            .map_err(|e| DispatchError::Spawn(e.to_string()))?;

        let _ = handle.shared.owner.set(join.thread().id());
        *handle
            .shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(join);
        info!(thread = %thread_name, "dispatcher started");
        Ok(handle)
    }
}

fn run_owner_thread<S, F>(handle: DispatcherHandle<S>, init: F)
where
    S: 'static,
    F: FnOnce(&DispatcherHandle<S>) -> S,
{
    let _ = handle.shared.owner.set(thread::current().id());

    let state = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| init(&handle))) {
        Ok(state) => state,
        Err(_) => {
            error!("dispatcher state initialisation panicked");
            handle.shutdown();
            return;
        }
    };

    let context = Rc::new(DispatchContext::new(handle.clone(), state));
    context::install(&context);
    context.run();
    context::uninstall();
    info!("dispatcher stopped");
}

/// Thread-safe entry point to a running dispatcher
pub struct DispatcherHandle<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for DispatcherHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> std::fmt::Debug for DispatcherHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("thread", &self.shared.config.thread_name)
            .field("queued", &self.queued_len())
            .finish()
    }
}

impl<S: 'static> DispatcherHandle<S> {
    /// Submit a unit from any thread
    ///
    /// On the owner thread this behaves like [`DispatchContext::submit`]:
    /// a unit whose level reaches the floor runs before this returns.
    pub fn submit<F>(&self, level: Level, unit: F) -> DispatchResult<()>
    where
        F: FnOnce(&DispatchContext<S>) -> anyhow::Result<()> + Send + 'static,
    {
        if let Some(context) = self.owner_context() {
            return context.submit_boxed(level, Box::new(unit));
        }
        self.shared.enqueue(level, None, Box::new(unit)).map(|_| ())
    }

    /// Resume a suspension; owner thread only
    pub fn resume(&self, id: SuspendId) -> DispatchResult<bool> {
        self.owner_context()
            .map(|context| context.resume(id))
            .ok_or(DispatchError::NotOwnerThread)
    }

    /// Cancel a suspension; owner thread only
    pub fn cancel(&self, id: SuspendId, reason: impl Into<String>) -> DispatchResult<bool> {
        let context = self.owner_context().ok_or(DispatchError::NotOwnerThread)?;
        Ok(context.cancel(id, reason))
    }

    fn owner_context(&self) -> Option<Rc<DispatchContext<S>>> {
        if !self.is_owner_thread() {
            return None;
        }
        context::current(&self.shared)
    }
}

impl<S> DispatcherHandle<S> {
    pub fn is_owner_thread(&self) -> bool {
        self.shared.is_owner_thread()
    }

    pub fn queued_len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_exiting()
    }

    /// Stop the loop and drop every queued unit
    ///
    /// Suspended units fail with `ShutDown`. Off the owner thread this also
    /// waits for the owner thread to finish.
    pub fn shutdown(&self) {
        let drained = {
            let mut queue = self.shared.lock();
            if queue.exit {
                Vec::new()
            } else {
                queue.exit = true;
                queue.drain()
            }
        };
        self.shared.wakeup.notify_all();

        let cancelled = drained.len() as u64;
        drop(drained);
        if cancelled > 0 {
            self.shared.stats.add_cancelled(cancelled);
            record_counter(UNITS_CANCELLED, cancelled);
        }
        info!(cancelled, "dispatcher shutting down");

        if self.is_owner_thread() {
            return;
        }
        let join = self
            .shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            if join.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}
