//! Lease records and the lease lock manager.
//!
//! A lease is the unit of namespace ownership: a subtree an envoy serves
//! locally or knows to be delegated elsewhere. Structural changes to a lease
//! (transfers, renames, revocations) must not overlap ordinary request
//! traffic, so each lease carries a reader count (`inflight`) and an
//! exclusive-intent owner. Many workers may hold a lease shared; a worker
//! that needs exclusivity first excludes new readers by claiming intent,
//! then waits for existing readers to drain.
//!
//! Contention is resolved through the engine: a worker that finds a lease
//! claimed registers on the claiming worker's blocked-on-me set and
//! suspends, re-running its work item once that worker finishes. Shared and
//! exclusive holds are released exclusively by the cleanup stack — except
//! for multistep changes, which detach their obligation on purpose and
//! release through [`Ctx::finish_multistep`].

use crate::engine::cleanup::CleanupEntry;
use crate::engine::suspend::{Step, Suspend};
use crate::engine::worker::{Ctx, Engine};
use crate::types::{LeaseId, WorkerId};
use crate::util::Arena;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Lock state for one lease.
#[derive(Debug)]
pub struct LeaseRecord {
    pub(crate) path: String,
    /// Active shared holders.
    pub(crate) inflight: u32,
    /// Worker currently excluding new shared acquisitions, if any.
    pub(crate) exclusive: Option<WorkerId>,
    /// Set while a multistep structural change retains ownership across
    /// scheduler yields.
    pub(crate) change_in_progress: bool,
}

/// Read-only snapshot of a lease's lock state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseView {
    /// Namespace path the lease covers.
    pub path: String,
    /// Active shared holders.
    pub inflight: u32,
    /// Exclusive-intent owner, if any.
    pub exclusive: Option<WorkerId>,
    /// Whether a multistep change is retaining ownership.
    pub change_in_progress: bool,
}

/// The lease table: arena records plus a path index.
pub(crate) struct LeaseTable {
    records: Arena<LeaseRecord>,
    by_path: HashMap<String, LeaseId>,
}

impl LeaseTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arena::with_capacity(capacity),
            by_path: HashMap::with_capacity(capacity),
        }
    }

    pub(crate) fn create(&mut self, path: &str) -> LeaseId {
        assert!(
            !self.by_path.contains_key(path),
            "lease already exists for path {path:?}"
        );
        let id = LeaseId(self.records.insert(LeaseRecord {
            path: path.to_owned(),
            inflight: 0,
            exclusive: None,
            change_in_progress: false,
        }));
        self.by_path.insert(path.to_owned(), id);
        debug!(lease = ?id, path, "lease created");
        id
    }

    pub(crate) fn destroy(&mut self, id: LeaseId) -> LeaseRecord {
        let record = self
            .records
            .remove(id.0)
            .expect("destroying a lease that does not exist");
        self.by_path.remove(&record.path);
        debug!(lease = ?id, path = %record.path, "lease destroyed");
        record
    }

    pub(crate) fn get(&self, id: LeaseId) -> Option<&LeaseRecord> {
        self.records.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: LeaseId) -> Option<&mut LeaseRecord> {
        self.records.get_mut(id.0)
    }

    pub(crate) fn find(&self, path: &str) -> Option<LeaseId> {
        self.by_path.get(path).copied()
    }
}

impl Engine {
    /// Creates a lease covering `path`.
    ///
    /// # Panics
    ///
    /// Panics if a lease for `path` already exists.
    pub fn create_lease(&self, path: &str) -> LeaseId {
        self.shared.state.lock().leases.create(path)
    }

    /// Destroys an unheld lease.
    ///
    /// # Panics
    ///
    /// Panics if the lease is still held shared or exclusively; ownership
    /// transfer flows destroy through [`Ctx::destroy_lease`] instead.
    pub fn destroy_lease(&self, lease: LeaseId) {
        let mut state = self.shared.state.lock();
        let record = state.leases.get(lease).expect("stale lease handle");
        assert!(
            record.inflight == 0 && record.exclusive.is_none(),
            "destroying a held lease: {lease:?}"
        );
        state.leases.destroy(lease);
    }

    /// Looks up a lease by path.
    #[must_use]
    pub fn find_lease(&self, path: &str) -> Option<LeaseId> {
        self.shared.state.lock().leases.find(path)
    }

    /// Snapshot of a lease's lock state.
    #[must_use]
    pub fn lease_view(&self, lease: LeaseId) -> Option<LeaseView> {
        let state = self.shared.state.lock();
        state.leases.get(lease).map(|record| LeaseView {
            path: record.path.clone(),
            inflight: record.inflight,
            exclusive: record.exclusive,
            change_in_progress: record.change_in_progress,
        })
    }
}

impl Ctx<'_> {
    /// Takes a shared hold on a lease.
    ///
    /// The exclusive-intent owner itself gets a free pass: it does not need
    /// to count as a reader of a lease it already excludes. Anyone else
    /// suspends while intent is claimed, re-running once the intender
    /// finishes.
    pub fn acquire_shared(&mut self, lease: LeaseId) -> Step {
        let me = self.worker;
        let owner = self
            .guard
            .leases
            .get(lease)
            .expect("stale lease handle")
            .exclusive;
        if owner == Some(me) {
            return Ok(());
        }
        self.guard.attempt_to_acquire(me, owner)?;
        let record = self.guard.leases.get_mut(lease).expect("stale lease handle");
        record.inflight += 1;
        trace!(?lease, worker = ?me, inflight = record.inflight, "shared hold");
        self.push_cleanup(CleanupEntry::LeaseShared(lease));
        Ok(())
    }

    /// Takes full exclusive ownership of a lease.
    ///
    /// Claims intent (excluding new readers), forgives any shared holds this
    /// worker already has on the lease, then waits for the remaining readers
    /// to drain. A suspension at any point leaves no partial state behind:
    /// intent survives on purpose (so the drain completes while we are
    /// parked) and the self-intent pass makes the re-run idempotent.
    pub fn acquire_exclusive(&mut self, lease: LeaseId) -> Step {
        let me = self.worker;
        let owner = self
            .guard
            .leases
            .get(lease)
            .expect("stale lease handle")
            .exclusive;
        self.guard.attempt_to_acquire(me, owner)?;

        let forgiven = self
            .guard
            .worker_mut(me)
            .cleanup
            .cancel_all(CleanupEntry::LeaseShared(lease));
        let record = self.guard.leases.get_mut(lease).expect("stale lease handle");
        record.inflight -= u32::try_from(forgiven).expect("hold count fits u32");
        record.exclusive = Some(me);

        if record.inflight > 0 {
            trace!(?lease, worker = ?me, inflight = record.inflight, "waiting for readers to drain");
            // The last draining reader promotes us; intent stays claimed.
            return Err(Suspend::Blocked);
        }

        debug!(?lease, worker = ?me, "exclusive ownership granted");
        self.push_cleanup(CleanupEntry::LeaseExclusive(lease));
        Ok(())
    }

    /// Detaches the exclusive hold from the cleanup stack and marks the
    /// lease as change-in-progress, so ownership survives multistep parks.
    ///
    /// # Panics
    ///
    /// Panics if this worker does not hold the lease exclusively.
    pub fn convert_to_multistep(&mut self, lease: LeaseId) {
        self.pop_cleanup(CleanupEntry::LeaseExclusive(lease));
        let record = self.guard.leases.get_mut(lease).expect("stale lease handle");
        record.change_in_progress = true;
        debug!(?lease, worker = ?self.worker, "exclusive hold converted to multistep");
    }

    /// Ends a multistep change, releasing exclusive ownership.
    ///
    /// # Panics
    ///
    /// Panics if this worker is not the exclusive owner.
    pub fn finish_multistep(&mut self, lease: LeaseId) {
        let me = self.worker;
        let record = self.guard.leases.get_mut(lease).expect("stale lease handle");
        assert_eq!(
            record.exclusive,
            Some(me),
            "finishing a multistep change this worker does not own"
        );
        record.change_in_progress = false;
        record.exclusive = None;
        debug!(?lease, worker = ?me, "multistep change finished");
    }

    /// Destroys a lease from inside a multistep change that owns it — the
    /// revoke side of an ownership transfer.
    ///
    /// # Panics
    ///
    /// Panics if this worker is not the exclusive owner, or if the hold was
    /// never converted to multistep (a cleanup-stack obligation pointing at
    /// a destroyed lease would be unreleasable).
    pub fn destroy_lease(&mut self, lease: LeaseId) {
        let me = self.worker;
        let record = self.guard.leases.get(lease).expect("stale lease handle");
        assert_eq!(
            record.exclusive,
            Some(me),
            "destroying a lease this worker does not own"
        );
        assert!(
            record.change_in_progress,
            "destroying a lease outside a multistep change"
        );
        self.guard.leases.destroy(lease);
    }

    /// Acquires exclusive intent over several leases, one at a time, in the
    /// caller's order — used by operations spanning multiple leases, such as
    /// a cross-lease rename.
    ///
    /// Unlike [`Ctx::acquire_exclusive`], this waits in place rather than
    /// unwinding, so leases claimed earlier in the set stay claimed; and it
    /// waits out its *own* shared holds too rather than forgiving them.
    /// No global lock ordering is imposed: callers locking overlapping sets
    /// must agree on an order or risk deadlock.
    pub fn join_multiple(&mut self, leases: &[LeaseId]) {
        let me = self.worker;
        for &lease in leases {
            loop {
                let owner = self
                    .guard
                    .leases
                    .get(lease)
                    .expect("stale lease handle")
                    .exclusive;
                match owner {
                    None => break,
                    Some(other) if other == me => break,
                    Some(other) => {
                        trace!(?lease, worker = ?me, owner = ?other, "join waiting for intent");
                        self.guard.register_blocked(other, me);
                        self.sleep();
                    }
                }
            }
            self.guard
                .leases
                .get_mut(lease)
                .expect("stale lease handle")
                .exclusive = Some(me);

            while self
                .guard
                .leases
                .get(lease)
                .expect("stale lease handle")
                .inflight
                > 0
            {
                trace!(?lease, worker = ?me, "join waiting for readers to drain");
                self.sleep();
            }
            self.push_cleanup(CleanupEntry::LeaseExclusive(lease));
        }
        debug!(count = leases.len(), worker = ?me, "joined lease set exclusively");
    }

    /// Looks up a lease by path.
    #[must_use]
    pub fn find_lease(&self, path: &str) -> Option<LeaseId> {
        self.guard.leases.find(path)
    }

    /// Creates a lease covering `path` (grant-side of an ownership
    /// transfer).
    ///
    /// # Panics
    ///
    /// Panics if a lease for `path` already exists.
    pub fn create_lease(&mut self, path: &str) -> LeaseId {
        self.guard.leases.create(path)
    }
}
