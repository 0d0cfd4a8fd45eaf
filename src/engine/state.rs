//! Shared engine state behind the global critical section.
//!
//! Everything mutable that workers coordinate through lives here: the worker
//! table, the ready queue and idle pool, the lease lock table, the object
//! lock table, the transaction registry, the connection table, and the
//! forwarding table. One [`parking_lot::Mutex`] guards the whole structure;
//! there are deliberately no finer-grained locks, which is what makes
//! retry-from-the-top unwinding sound.

use crate::dispatch::ForwardTable;
use crate::engine::cleanup::{CleanupEntry, CleanupStack, ResourceReleaser};
use crate::engine::ready_queue::ReadyQueue;
use crate::engine::suspend::{Step, Suspend};
use crate::engine::worker::WorkItem;
use crate::error::Error;
use crate::lease::LeaseTable;
use crate::registry::TransactionTable;
use crate::transport::{ConnectionTable, TransportNotifier};
use crate::types::{ResourceKind, TxnId, WorkerId};
use crate::EngineConfig;
use parking_lot::Condvar;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// One cooperatively scheduled unit of sequential execution.
///
/// A record is mutated only by its own thread and by the scheduler, always
/// under the big lock.
pub(crate) struct WorkerRecord {
    /// Spawn-order priority; wrapping, compared with the wraparound rule.
    pub(crate) priority: u32,
    /// Private wake condition, used only to resume this specific worker.
    pub(crate) condvar: Arc<Condvar>,
    /// The pending work item, if one has been assigned.
    pub(crate) work: Option<WorkItem>,
    /// Workers waiting for this one to finish; promoted to the ready queue
    /// when it completes its work item.
    pub(crate) blocked_on_me: SmallVec<[WorkerId; 4]>,
    /// Outstanding release obligations for the current attempt.
    pub(crate) cleanup: CleanupStack,
    /// Whether this worker currently sits in the ready queue. Keeps a
    /// worker from being queued twice, which would waste a wakeup on a
    /// worker that is no longer waiting.
    pub(crate) queued: bool,
}

impl WorkerRecord {
    fn new(priority: u32, work: Option<WorkItem>) -> Self {
        Self {
            priority,
            condvar: Arc::new(Condvar::new()),
            work,
            blocked_on_me: SmallVec::new(),
            cleanup: CleanupStack::default(),
            queued: false,
        }
    }
}

impl core::fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("priority", &self.priority)
            .field("has_work", &self.work.is_some())
            .field("blocked_on_me", &self.blocked_on_me)
            .finish_non_exhaustive()
    }
}

/// All coordination state, guarded by the engine's single mutex.
pub(crate) struct EngineState {
    pub(crate) workers: crate::util::Arena<WorkerRecord>,
    pub(crate) ready: ReadyQueue,
    /// Idle pooled workers, most recently idled last.
    pub(crate) idle_pool: Vec<WorkerId>,
    /// Workers currently inside a work item (reply waits subtract
    /// themselves; see the registry's batch correction).
    pub(crate) active: usize,
    next_priority: u32,
    pub(crate) leases: LeaseTable,
    /// Owner bits for collaborator objects, keyed by (kind, handle).
    pub(crate) object_locks: HashMap<(ResourceKind, u64), WorkerId>,
    pub(crate) txns: TransactionTable,
    /// Failures that could not be handled in-line, drained (fatally) by the
    /// top-level event loop. The transaction handle is present when the
    /// failure was posted against one.
    pub(crate) error_queue: VecDeque<(Option<TxnId>, Error)>,
    pub(crate) connections: ConnectionTable,
    pub(crate) forwards: ForwardTable,
    pub(crate) notifier: Option<Arc<dyn TransportNotifier>>,
    pub(crate) releaser: Option<Arc<dyn ResourceReleaser>>,
}

impl EngineState {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        let capacity = config.initial_table_capacity;
        Self {
            workers: crate::util::Arena::with_capacity(capacity),
            ready: ReadyQueue::with_capacity(config.ready_queue_capacity),
            idle_pool: Vec::new(),
            active: 0,
            next_priority: 0,
            leases: LeaseTable::with_capacity(capacity),
            object_locks: HashMap::new(),
            txns: TransactionTable::with_capacity(capacity),
            error_queue: VecDeque::new(),
            connections: ConnectionTable::with_capacity(capacity),
            forwards: ForwardTable::default(),
            notifier: None,
            releaser: None,
        }
    }

    /// Assigns the next spawn priority.
    pub(crate) fn alloc_priority(&mut self) -> u32 {
        let priority = self.next_priority;
        self.next_priority = self.next_priority.wrapping_add(1);
        priority
    }

    /// Creates a worker record with an assigned priority.
    pub(crate) fn create_worker(&mut self, work: Option<WorkItem>) -> WorkerId {
        let priority = self.alloc_priority();
        WorkerId(self.workers.insert(WorkerRecord::new(priority, work)))
    }

    pub(crate) fn worker(&self, id: WorkerId) -> &WorkerRecord {
        self.workers.get(id.0).expect("stale worker handle")
    }

    pub(crate) fn worker_mut(&mut self, id: WorkerId) -> &mut WorkerRecord {
        self.workers.get_mut(id.0).expect("stale worker handle")
    }

    /// Puts a worker on the ready queue at its current priority. A worker
    /// already queued stays where it is.
    pub(crate) fn make_ready(&mut self, id: WorkerId) {
        let record = self.worker_mut(id);
        if record.queued {
            return;
        }
        record.queued = true;
        let priority = record.priority;
        self.ready.push(priority, id);
    }

    /// Signals the earliest-created ready worker, if any. Entries for
    /// workers that have since retired are skipped.
    pub(crate) fn wake_next(&mut self) {
        while let Some(id) = self.ready.pop() {
            if let Some(record) = self.workers.get_mut(id.0) {
                record.queued = false;
                trace!(worker = ?id, "waking next ready worker");
                record.condvar.notify_one();
                return;
            }
        }
    }

    /// Registers `waiter` to be promoted when `on` finishes its work item.
    pub(crate) fn register_blocked(&mut self, on: WorkerId, waiter: WorkerId) {
        let blocked = &mut self.worker_mut(on).blocked_on_me;
        if !blocked.contains(&waiter) {
            blocked.push(waiter);
        }
    }

    /// Tries to claim a resource currently marked as owned by `owner`.
    ///
    /// Succeeds when the resource is free or already ours. Otherwise the
    /// calling worker registers on the owner's blocked-on-me set and
    /// suspends; by the time it re-runs its work item the owner has finished
    /// or released.
    pub(crate) fn attempt_to_acquire(
        &mut self,
        me: WorkerId,
        owner: Option<WorkerId>,
    ) -> Step {
        match owner {
            None => Ok(()),
            Some(other) if other == me => Ok(()),
            Some(other) => {
                trace!(worker = ?me, blocked_on = ?other, "lock contention");
                self.register_blocked(other, me);
                Err(Suspend::Blocked)
            }
        }
    }

    /// Unwinds the worker's entire cleanup stack, releasing every resource
    /// the current attempt acquired.
    pub(crate) fn unwind(&mut self, me: WorkerId) {
        while let Some(entry) = self.worker_mut(me).cleanup.pop() {
            self.release(me, entry);
        }
    }

    /// Releases one unwound obligation.
    fn release(&mut self, me: WorkerId, entry: CleanupEntry) {
        match entry {
            CleanupEntry::LeaseShared(lease) => {
                let (inflight, intender) = {
                    let record = self.leases.get_mut(lease).expect("stale lease handle");
                    record.inflight -= 1;
                    (record.inflight, record.exclusive)
                };
                trace!(?lease, inflight, "shared hold released");
                if inflight == 0 {
                    // The lease stays obstructed: an exclusive intender (if
                    // any) keeps its claim and is promoted once we finish.
                    if let Some(intender) = intender {
                        self.register_blocked(me, intender);
                    }
                }
            }
            CleanupEntry::LeaseExclusive(lease) => {
                let record = self.leases.get_mut(lease).expect("stale lease handle");
                trace!(?lease, "exclusive hold released");
                record.exclusive = None;
            }
            CleanupEntry::Object(kind, handle) => {
                self.object_locks.remove(&(kind, handle));
                if let Some(releaser) = &self.releaser {
                    releaser.release(kind, handle);
                }
            }
        }
    }

    /// Moves everything waiting on `me` to the ready queue.
    pub(crate) fn promote_blocked(&mut self, me: WorkerId) {
        let waiters = core::mem::take(&mut self.worker_mut(me).blocked_on_me);
        for waiter in waiters {
            if self.workers.contains(waiter.0) {
                self.make_ready(waiter);
            }
        }
    }
}

impl core::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EngineState")
            .field("workers", &self.workers.len())
            .field("ready", &self.ready.len())
            .field("idle_pool", &self.idle_pool.len())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
