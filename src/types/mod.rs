//! Core identifier types.
//!
//! Every long-lived entity (worker, lease, transaction, connection) lives in
//! an arena and is named by a generation-tagged handle. Handles are cheap to
//! copy and safe against reuse: a stale handle fails its generation check
//! rather than aliasing a recycled slot.

use crate::util::ArenaIndex;
use core::fmt;

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) ArenaIndex);

        impl $name {
            /// Wraps a raw arena index.
            #[inline]
            #[must_use]
            pub const fn from_arena(index: ArenaIndex) -> Self {
                Self(index)
            }

            /// The underlying arena index.
            #[inline]
            #[must_use]
            pub const fn arena_index(self) -> ArenaIndex {
                self.0
            }

            /// Builds a handle from raw parts, for tests.
            #[inline]
            #[must_use]
            pub const fn new_for_test(slot: u32, generation: u32) -> Self {
                Self(ArenaIndex::new(slot, generation))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }
    };
}

arena_id! {
    /// Handle for a worker record in the engine's worker table.
    WorkerId
}

arena_id! {
    /// Handle for a lease record in the lease table.
    LeaseId
}

arena_id! {
    /// Handle for a transaction record in the transaction registry.
    TxnId
}

arena_id! {
    /// Handle for a connection record in the connection table.
    ConnId
}

/// Connection-scoped identifier correlating a request with its reply.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u16);

impl Tag {
    /// Sentinel tag carried by version negotiation, never allocated.
    pub const NONE: Self = Self(u16::MAX);
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            write!(f, "Tag(NONE)")
        } else {
            write!(f, "Tag({})", self.0)
        }
    }
}

/// Client-scoped handle referencing a file object, possibly delegated to a
/// remote envoy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fid(pub u32);

impl fmt::Debug for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fid({})", self.0)
    }
}

/// Resource kinds tracked by the cleanup stack for collaborator-owned
/// objects. The engine records ownership only; releasing the object itself
/// is the collaborator's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A fid table entry.
    Fid,
    /// An in-progress namespace walk.
    Walk,
    /// A claim on a namespace node.
    Claim,
    /// A cached object directory.
    Directory,
    /// An open file handle.
    OpenFile,
    /// A fid delegated to us by a remote envoy.
    RemoteFid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_compare_by_slot_and_generation() {
        let a = WorkerId::new_for_test(1, 0);
        let b = WorkerId::new_for_test(1, 0);
        let c = WorkerId::new_for_test(1, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tag_debug_marks_sentinel() {
        assert_eq!(format!("{:?}", Tag::NONE), "Tag(NONE)");
        assert_eq!(format!("{:?}", Tag(7)), "Tag(7)");
    }

    #[test]
    fn handle_debug_is_compact() {
        let id = LeaseId::new_for_test(3, 2);
        assert_eq!(format!("{id:?}"), "LeaseId(3v2)");
    }
}
