//! Error types for the coordination core.
//!
//! Three tiers of failure exist here, and only one of them is an `Error`:
//!
//! - Lock-contention backoff is not an error at all. It travels as
//!   [`crate::engine::Suspend`] and is always recovered by unwinding and
//!   re-running the work item.
//! - Protocol misuse (a request illegal for the connection's role, a tag
//!   collision, a reply nobody asked for) produces an [`Error`] and lands on
//!   the registry's error queue; the top-level event loop halts when it
//!   drains one, because misuse at this layer means a logic bug elsewhere.
//! - Coordination-invariant violations (popping a cleanup entry that was
//!   never pushed, attaching a second reply) panic outright. A broken
//!   invariant means shared state can no longer be trusted.

use crate::types::{ConnId, Tag};
use core::fmt;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Protocol misuse ===
    /// Request kind is not recognized at all.
    BadRequest,
    /// Request kind is illegal for the connection's current role.
    RoleViolation,
    /// An inbound request reused a tag that is still outstanding.
    TagCollision,
    /// A reply arrived carrying a tag with no registered transaction.
    UnexpectedReply,
    /// A fid-addressed operation named a delegate we have no connection to.
    NoRouteToDelegate,

    // === Transport boundary ===
    /// The connection disappeared under an in-flight operation.
    ConnectionClosed,
    /// The socket collaborator reported a failure.
    TransportFailed,

    // === Configuration ===
    /// Invalid engine configuration.
    Config,

    // === Internal ===
    /// A bug in the coordination core itself.
    Internal,
}

/// Coarse grouping of error kinds, mirroring the recovery policy: protocol
/// errors halt the event loop, transport errors are surfaced to the caller,
/// the rest indicate setup or internal faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Wire-level misuse; fatal by design when drained by the event loop.
    Protocol,
    /// Failures at the socket boundary.
    Transport,
    /// Configuration problems caught before the engine runs.
    Config,
    /// Internal faults.
    Internal,
}

impl ErrorKind {
    /// Returns the category for this kind.
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::BadRequest
            | Self::RoleViolation
            | Self::TagCollision
            | Self::UnexpectedReply
            | Self::NoRouteToDelegate => ErrorCategory::Protocol,
            Self::ConnectionClosed | Self::TransportFailed => ErrorCategory::Transport,
            Self::Config => ErrorCategory::Config,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "unrecognized request",
            Self::RoleViolation => "request illegal for connection role",
            Self::TagCollision => "tag already outstanding on connection",
            Self::UnexpectedReply => "reply with no registered transaction",
            Self::NoRouteToDelegate => "no connection to delegate envoy",
            Self::ConnectionClosed => "connection closed",
            Self::TransportFailed => "transport failure",
            Self::Config => "invalid configuration",
            Self::Internal => "internal error",
        }
    }
}

/// An error from the coordination core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    conn: Option<ConnId>,
    tag: Option<Tag>,
    detail: Option<&'static str>,
}

impl Error {
    /// Creates an error of the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            conn: None,
            tag: None,
            detail: None,
        }
    }

    /// Attaches the connection the failure was observed on.
    #[must_use]
    pub const fn on_conn(mut self, conn: ConnId) -> Self {
        self.conn = Some(conn);
        self
    }

    /// Attaches the tag involved in the failure.
    #[must_use]
    pub const fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Attaches a static detail string.
    #[must_use]
    pub const fn with_detail(mut self, detail: &'static str) -> Self {
        self.detail = Some(detail);
        self
    }

    /// The error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// The connection involved, if recorded.
    #[must_use]
    pub const fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    /// The tag involved, if recorded.
    #[must_use]
    pub const fn tag(&self) -> Option<Tag> {
        self.tag
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(conn) = self.conn {
            write!(f, " (conn {conn:?}")?;
            if let Some(tag) = self.tag {
                write!(f, ", {tag:?}")?;
            }
            write!(f, ")")?;
        } else if let Some(tag) = self.tag {
            write!(f, " ({tag:?})")?;
        }
        if let Some(detail) = self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}
