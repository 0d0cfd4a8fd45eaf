//! Worker threads, the engine handle, and the handler context.
//!
//! A worker thread's life mirrors its work items: admission behind older
//! ready workers, then a bounded number of items (so the pool can grow and
//! shrink with load), each run inside a retry loop that re-invokes the item
//! from the top after every `Blocked`/`Retry` suspension. Between items the
//! worker parks in the idle pool; after its last item the thread retires and
//! its record is destroyed.

use crate::config::ConfigError;
use crate::engine::cleanup::CleanupEntry;
use crate::engine::state::EngineState;
use crate::engine::suspend::{Step, Suspend};
use crate::types::{ResourceKind, WorkerId};
use crate::EngineConfig;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A unit of work: re-invoked from the top after every suspension, so it
/// must be safe to run repeatedly.
pub type WorkItem = Arc<dyn Fn(&mut Ctx<'_>) -> Step + Send + Sync>;

pub(crate) struct EngineShared {
    pub(crate) state: Mutex<EngineState>,
    pub(crate) config: EngineConfig,
}

/// Handle to the coordination engine. Cheap to clone; all clones share the
/// same state.
#[derive(Clone)]
pub struct Engine {
    pub(crate) shared: Arc<EngineShared>,
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

impl Engine {
    /// Creates an engine with the given configuration.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = EngineState::new(&config);
        Ok(Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(state),
                config,
            }),
        })
    }

    /// Schedules a work item, reusing the most recently idled pooled worker
    /// or spawning a new one.
    ///
    /// Call this from outside the engine (the event loop, tests). Handler
    /// code already inside the critical section must use [`Ctx::spawn`]
    /// instead.
    pub fn spawn<F>(&self, work: F) -> WorkerId
    where
        F: Fn(&mut Ctx<'_>) -> Step + Send + Sync + 'static,
    {
        self.spawn_item(Arc::new(work))
    }

    pub(crate) fn spawn_item(&self, work: WorkItem) -> WorkerId {
        let mut state = self.shared.state.lock();
        spawn_locked(&self.shared, &mut state, work)
    }

    /// Installs the next step of a multistep operation on a parked worker
    /// and wakes it.
    ///
    /// # Panics
    ///
    /// Panics if the worker's work slot is still occupied — handing a step
    /// to a worker that has not parked breaks the handoff invariant.
    pub fn continue_multistep<F>(&self, worker: WorkerId, work: F)
    where
        F: Fn(&mut Ctx<'_>) -> Step + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock();
        install_step(&mut state, worker, Arc::new(work));
    }

    /// Number of workers currently inside a work item.
    ///
    /// Workers parked in a reply wait are not counted; the transport
    /// collaborator can use this for admission decisions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.state.lock().active
    }

    /// Installs the hook that releases collaborator objects when an unwind
    /// drops their obligations.
    pub fn set_releaser(&self, releaser: Arc<dyn crate::engine::cleanup::ResourceReleaser>) {
        self.shared.state.lock().releaser = Some(releaser);
    }

    /// Waits until no work is active or ready, up to the configured drain
    /// timeout. Returns whether the engine quiesced.
    #[must_use]
    pub fn drain(&self) -> bool {
        let deadline = Instant::now() + self.shared.config.drain_timeout;
        loop {
            {
                let state = self.shared.state.lock();
                if state.active == 0 && state.ready.is_empty() {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// The capability handed to handler code: the big-lock guard plus the
/// identity of the worker running the item.
///
/// Everything a handler may do — take locks, issue requests, record cleanup
/// obligations, spawn further work — goes through this context, which is what
/// keeps all shared-state mutation inside the critical section.
pub struct Ctx<'a> {
    pub(crate) shared: &'a Arc<EngineShared>,
    pub(crate) guard: MutexGuard<'a, EngineState>,
    pub(crate) worker: WorkerId,
}

impl<'a> Ctx<'a> {
    /// The worker executing the current work item.
    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// A fresh engine handle.
    #[must_use]
    pub fn engine(&self) -> Engine {
        Engine {
            shared: Arc::clone(self.shared),
        }
    }

    /// Records a release obligation for the current attempt.
    pub fn push_cleanup(&mut self, entry: CleanupEntry) {
        self.guard.worker_mut(self.worker).cleanup.push(entry);
    }

    /// Cancels an obligation without releasing the resource.
    ///
    /// This does not decrement lease counts or clear owners; it only stops
    /// the unwinder from doing so later. Use it when responsibility for the
    /// resource is transferred elsewhere.
    ///
    /// # Panics
    ///
    /// Panics if no matching obligation is outstanding.
    pub fn pop_cleanup(&mut self, entry: CleanupEntry) {
        self.guard.worker_mut(self.worker).cleanup.cancel(entry);
    }

    /// Abandons the current attempt and re-runs the work item from the top.
    pub fn retry<T>(&self) -> Step<T> {
        Err(Suspend::Retry)
    }

    /// Parks this worker until the next step of a multistep operation is
    /// installed. Obligations not detached beforehand are unwound.
    pub fn park_for_next_step<T>(&self) -> Step<T> {
        Err(Suspend::Multistep)
    }

    /// Locks a collaborator object for this worker, suspending if another
    /// worker owns it.
    pub fn acquire_object(&mut self, kind: ResourceKind, handle: u64) -> Step {
        let me = self.worker;
        let owner = self.guard.object_locks.get(&(kind, handle)).copied();
        self.guard.attempt_to_acquire(me, owner)?;
        self.guard.object_locks.insert((kind, handle), me);
        self.push_cleanup(CleanupEntry::Object(kind, handle));
        Ok(())
    }

    /// Releases an object lock taken with [`Ctx::acquire_object`] before the
    /// work item ends.
    pub fn release_object(&mut self, kind: ResourceKind, handle: u64) {
        self.pop_cleanup(CleanupEntry::Object(kind, handle));
        self.guard.object_locks.remove(&(kind, handle));
    }

    /// Schedules a further work item from inside a handler.
    pub fn spawn<F>(&mut self, work: F) -> WorkerId
    where
        F: Fn(&mut Ctx<'_>) -> Step + Send + Sync + 'static,
    {
        spawn_locked(self.shared, &mut self.guard, Arc::new(work))
    }

    /// Installs the next step on a parked multistep worker and wakes it.
    ///
    /// # Panics
    ///
    /// Panics if the worker's work slot is still occupied.
    pub fn continue_multistep<F>(&mut self, worker: WorkerId, work: F)
    where
        F: Fn(&mut Ctx<'_>) -> Step + Send + Sync + 'static,
    {
        install_step(&mut self.guard, worker, Arc::new(work));
    }

    /// Sleeps on this worker's private condvar, releasing the big lock for
    /// the duration. Callers re-check their condition on wake.
    pub(crate) fn sleep(&mut self) {
        let condvar = Arc::clone(&self.guard.worker(self.worker).condvar);
        condvar.wait(&mut self.guard);
    }

    /// Sleeps on an arbitrary condvar tied to the big lock (reply waits).
    pub(crate) fn sleep_on(&mut self, condvar: &Condvar) {
        condvar.wait(&mut self.guard);
    }
}

pub(crate) fn spawn_locked(
    shared: &Arc<EngineShared>,
    state: &mut EngineState,
    work: WorkItem,
) -> WorkerId {
    if let Some(id) = state.idle_pool.pop() {
        let priority = state.alloc_priority();
        let record = state.worker_mut(id);
        record.priority = priority;
        record.work = Some(work);
        trace!(worker = ?id, priority, "reusing pooled worker");
        if state.ready.is_empty() {
            state.worker(id).condvar.notify_one();
        } else {
            // Older ready workers go first; this one waits its turn.
            state.wake_next();
            state.make_ready(id);
        }
        id
    } else {
        let id = state.create_worker(Some(work));
        trace!(worker = ?id, "spawning worker thread");
        let shared = Arc::clone(shared);
        thread::Builder::new()
            .name(format!("envoy-worker-{}", id.0.slot()))
            .stack_size(shared.config.worker_stack_size)
            .spawn(move || worker_loop(&shared, id))
            .expect("failed to spawn worker thread");
        id
    }
}

fn install_step(state: &mut EngineState, worker: WorkerId, work: WorkItem) {
    let record = state.worker_mut(worker);
    assert!(
        record.work.is_none(),
        "multistep hand-off to a worker whose slot is occupied: {worker:?}"
    );
    record.work = Some(work);
    record.condvar.notify_one();
}

fn wait_for_wake(guard: &mut MutexGuard<'_, EngineState>, me: WorkerId) {
    let condvar = Arc::clone(&guard.worker(me).condvar);
    condvar.wait(guard);
}

fn worker_loop(shared: &Arc<EngineShared>, me: WorkerId) {
    let lifetime = shared.config.worker_lifetime;
    let mut guard = shared.state.lock();

    if !guard.ready.is_empty() {
        // Admission: workers that were ready first run first.
        guard.wake_next();
        guard.make_ready(me);
        wait_for_wake(&mut guard, me);
    }

    for item_index in 0..lifetime {
        if item_index > 0 {
            // Wait in the pool for the next request.
            guard.idle_pool.push(me);
            while guard.worker(me).work.is_none() {
                wait_for_wake(&mut guard, me);
            }
        }
        guard.active += 1;

        loop {
            let item = guard
                .worker(me)
                .work
                .clone()
                .expect("worker woken without a work item");
            let mut ctx = Ctx {
                shared,
                guard,
                worker: me,
            };
            let step = item(&mut ctx);
            guard = ctx.guard;

            match step {
                Ok(()) => break,
                Err(Suspend::Blocked) => {
                    trace!(worker = ?me, "blocked; unwinding and parking");
                    guard.unwind(me);
                    guard.wake_next();
                    wait_for_wake(&mut guard, me);
                }
                Err(Suspend::Retry) => {
                    trace!(worker = ?me, "retrying work item from the top");
                    guard.unwind(me);
                }
                Err(Suspend::Multistep) => {
                    debug!(worker = ?me, "parked awaiting next multistep step");
                    guard.unwind(me);
                    guard.worker_mut(me).work = None;
                    guard.wake_next();
                    while guard.worker(me).work.is_none() {
                        wait_for_wake(&mut guard, me);
                    }
                    debug!(worker = ?me, "multistep step installed; resuming");
                }
            }
        }

        guard.unwind(me);
        guard.worker_mut(me).work = None;
        guard.promote_blocked(me);
        guard.active -= 1;
        guard.wake_next();
    }

    trace!(worker = ?me, "worker retiring");
    guard.workers.remove(me.0);
    drop(guard);
}
