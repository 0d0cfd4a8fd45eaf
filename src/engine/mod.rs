//! The cooperative worker engine.
//!
//! All request handling runs under a single global critical section: one
//! [`parking_lot::Mutex`] guards every shared table, and at most one worker
//! executes handler logic at any instant. Workers are real threads, but they
//! coordinate cooperatively — a worker runs until it completes its work item
//! or reaches an explicit suspension point (lock contention, a reply wait, a
//! multistep handoff), and the next worker to run is chosen from a
//! priority-ordered ready queue that approximates "longest waiting first".
//!
//! Suspension is a normal early return: a handler that cannot proceed
//! returns [`Suspend`] through `?`, its cleanup stack is unwound (releasing
//! everything acquired during the attempt), and the whole work item re-runs
//! from the top once the obstruction clears. Handlers are therefore written
//! idempotent-from-the-top; nothing they acquired in a discarded attempt
//! survives into the next one.

pub mod cleanup;
pub mod ready_queue;
pub mod state;
pub mod suspend;
pub mod worker;

pub use cleanup::{CleanupEntry, ResourceReleaser};
pub use suspend::{Step, Suspend};
pub use worker::{Ctx, Engine, WorkItem};
