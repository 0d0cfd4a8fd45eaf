//! The per-worker cleanup stack.
//!
//! Every acquisition that can outlive a suspension pushes an entry here
//! before (or atomically with) taking the resource. Whenever a worker
//! suspends or finishes a work item the stack is unwound LIFO, releasing
//! everything the current attempt acquired. This is the *only* path that
//! releases locks — nothing else needs to remember what a discarded attempt
//! was holding.

use crate::types::{LeaseId, ResourceKind};
use smallvec::SmallVec;

/// Collaborator hook invoked when an unwind releases an object whose
/// substance lives outside the engine — a delegated remote fid to close, a
/// claim to return to its cache. Runs under the global critical section, so
/// implementations must not block.
pub trait ResourceReleaser: Send + Sync {
    /// Releases the collaborator object behind an unwound obligation.
    fn release(&self, kind: ResourceKind, handle: u64);
}

/// A tagged release obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupEntry {
    /// One shared hold on a lease; unwinding decrements the inflight count.
    LeaseShared(LeaseId),
    /// Full exclusive ownership of a lease; unwinding clears the owner.
    LeaseExclusive(LeaseId),
    /// Ownership of a collaborator object (fid, walk, claim, ...); unwinding
    /// clears the owner bit in the object-lock table.
    Object(ResourceKind, u64),
}

/// The ordered obligation stack for one worker.
#[derive(Debug, Default)]
pub(crate) struct CleanupStack {
    entries: SmallVec<[CleanupEntry; 8]>,
}

impl CleanupStack {
    /// Records an obligation.
    pub fn push(&mut self, entry: CleanupEntry) {
        self.entries.push(entry);
    }

    /// Takes the most recently pushed obligation, if any.
    pub fn pop(&mut self) -> Option<CleanupEntry> {
        self.entries.pop()
    }

    /// Cancels the most recent matching obligation without releasing it.
    ///
    /// # Panics
    ///
    /// Panics when no matching entry exists: cancelling an obligation that
    /// was never recorded means the coordination invariants are already
    /// broken.
    pub fn cancel(&mut self, entry: CleanupEntry) {
        let at = self
            .entries
            .iter()
            .rposition(|have| *have == entry)
            .unwrap_or_else(|| panic!("cancelling cleanup entry never pushed: {entry:?}"));
        self.entries.remove(at);
    }

    /// Cancels every matching obligation, returning how many were removed.
    ///
    /// Used when a worker upgrades a lease it already holds shared: the
    /// shared obligations are forgiven rather than unwound.
    pub fn cancel_all(&mut self, entry: CleanupEntry) -> usize {
        let before = self.entries.len();
        self.entries.retain(|have| *have != entry);
        before - self.entries.len()
    }

    /// Number of outstanding obligations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no obligations are outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
