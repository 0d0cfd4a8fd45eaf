//! Coordination core for a distributed, lease-migrating network file service.
//!
//! An envoy owns subtrees ("leases") of a shared namespace and serves
//! file-protocol requests against them; ownership of a subtree can migrate to
//! another envoy, after which requests for it are forwarded transparently.
//! This crate implements the concurrency machinery that makes that safe:
//!
//! - [`engine`]: a cooperative worker engine. All request handling runs under
//!   one global critical section; workers suspend at explicit points only
//!   (lock contention, reply waits, multistep handoff) and re-attempt their
//!   work item from the top after a suspension.
//! - [`lease`]: shared/exclusive locking over leases, with multistep
//!   ownership handoff for transfer operations that span scheduler yields.
//! - [`registry`]: tag-correlated request/reply transactions, including
//!   batch waits that absorb coalesced reply wakeups without skewing the
//!   engine's active-worker accounting.
//! - [`dispatch`]: role-aware routing of inbound requests, forwarding
//!   fid-addressed operations whose objects have been delegated away.
//! - [`transport`]: the connection table and the top-level event loop; the
//!   socket layer itself lives behind the [`transport::Transport`] trait.
//!
//! Handlers are written idempotent-from-the-top: any acquisition that can
//! block returns [`engine::Suspend`] through `?`, the worker's cleanup stack
//! is unwound (releasing every resource taken so far in the attempt), and the
//! whole work item re-runs once the obstruction clears. The cleanup stack is
//! the only mechanism that releases locks, so an unwind can never leak.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod lease;
pub mod registry;
pub mod test_logging;
pub mod transport;
pub mod types;
pub mod util;

pub use config::{ConfigError, EngineConfig, EngineProfile};
pub use dispatch::{ForwardRecord, Handlers};
pub use engine::{CleanupEntry, Ctx, Engine, ResourceReleaser, Step, Suspend, WorkItem};
pub use error::{Error, ErrorCategory, ErrorKind};
pub use lease::LeaseView;
pub use transport::{
    ConnectionRole, EventLoop, Message, MessageKind, Transport, TransportEvent,
    TransportNotifier,
};
pub use types::{ConnId, Fid, LeaseId, ResourceKind, Tag, TxnId, WorkerId};
