//! Protocol messages at the coordination boundary.
//!
//! Byte layout is owned by the codec collaborator; this layer sees messages
//! only as a tag, a kind, an optional fid, and an opaque body. The kind
//! carries exactly enough structure for routing: request/response pairing,
//! whether an operation is addressed through a fid (and thus forwardable),
//! and whether it belongs to the inter-envoy administration protocol.

use crate::types::{Fid, Tag};
use bytes::Bytes;

/// Message discriminants: `T*` requests pair with `R*` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum MessageKind {
    // Session setup and client operations.
    TVersion,
    RVersion,
    TAuth,
    RAuth,
    TAttach,
    RAttach,
    TFlush,
    RFlush,
    TWalk,
    RWalk,
    TOpen,
    ROpen,
    TCreate,
    RCreate,
    TRead,
    RRead,
    TWrite,
    RWrite,
    TClunk,
    RClunk,
    TRemove,
    RRemove,
    TStat,
    RStat,
    TWriteStat,
    RWriteStat,

    // Inter-envoy administration.
    TSetAddress,
    RSetAddress,
    TWalkRemote,
    RWalkRemote,
    TStatRemote,
    RStatRemote,
    TCloseFid,
    RCloseFid,
    TSnapshot,
    RSnapshot,
    TGrant,
    RGrant,
    TRevoke,
    RRevoke,
    TMigrate,
    RMigrate,
    TNominate,
    RNominate,
    TRenameTree,
    RRenameTree,

    /// Error response, legal as the reply to any request.
    RError,
}

impl MessageKind {
    /// True for `T*` kinds.
    #[must_use]
    pub const fn is_request(self) -> bool {
        matches!(
            self,
            Self::TVersion
                | Self::TAuth
                | Self::TAttach
                | Self::TFlush
                | Self::TWalk
                | Self::TOpen
                | Self::TCreate
                | Self::TRead
                | Self::TWrite
                | Self::TClunk
                | Self::TRemove
                | Self::TStat
                | Self::TWriteStat
                | Self::TSetAddress
                | Self::TWalkRemote
                | Self::TStatRemote
                | Self::TCloseFid
                | Self::TSnapshot
                | Self::TGrant
                | Self::TRevoke
                | Self::TMigrate
                | Self::TNominate
                | Self::TRenameTree
        )
    }

    /// The response kind paired with this request.
    ///
    /// # Panics
    ///
    /// Panics when called on a response kind.
    #[must_use]
    pub const fn response(self) -> Self {
        match self {
            Self::TVersion => Self::RVersion,
            Self::TAuth => Self::RAuth,
            Self::TAttach => Self::RAttach,
            Self::TFlush => Self::RFlush,
            Self::TWalk => Self::RWalk,
            Self::TOpen => Self::ROpen,
            Self::TCreate => Self::RCreate,
            Self::TRead => Self::RRead,
            Self::TWrite => Self::RWrite,
            Self::TClunk => Self::RClunk,
            Self::TRemove => Self::RRemove,
            Self::TWriteStat => Self::RWriteStat,
            Self::TStat => Self::RStat,
            Self::TSetAddress => Self::RSetAddress,
            Self::TWalkRemote => Self::RWalkRemote,
            Self::TStatRemote => Self::RStatRemote,
            Self::TCloseFid => Self::RCloseFid,
            Self::TSnapshot => Self::RSnapshot,
            Self::TGrant => Self::RGrant,
            Self::TRevoke => Self::RRevoke,
            Self::TMigrate => Self::RMigrate,
            Self::TNominate => Self::RNominate,
            Self::TRenameTree => Self::RRenameTree,
            _ => panic!("response() called on a non-request kind"),
        }
    }

    /// True for operations addressed through a fid, which consult the
    /// forwarding table before being handled locally.
    #[must_use]
    pub const fn is_fid_addressed(self) -> bool {
        matches!(
            self,
            Self::TOpen
                | Self::TCreate
                | Self::TRead
                | Self::TWrite
                | Self::TClunk
                | Self::TRemove
                | Self::TStat
                | Self::TWriteStat
        )
    }

    /// True for inter-envoy administration requests.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(
            self,
            Self::TSetAddress
                | Self::TWalkRemote
                | Self::TStatRemote
                | Self::TCloseFid
                | Self::TSnapshot
                | Self::TGrant
                | Self::TRevoke
                | Self::TMigrate
                | Self::TNominate
                | Self::TRenameTree
        )
    }
}

/// A decoded message crossing the coordination boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Connection-scoped correlation tag.
    pub tag: Tag,
    /// Routing discriminant.
    pub kind: MessageKind,
    /// Addressed fid, for operations that carry one.
    pub fid: Option<Fid>,
    /// Opaque payload, owned by the codec collaborator.
    pub body: Bytes,
}

impl Message {
    /// Builds a request message. Outbound requests carry [`Tag::NONE`] until
    /// the registry assigns a real tag at send time.
    #[must_use]
    pub fn request(kind: MessageKind, fid: Option<Fid>, body: Bytes) -> Self {
        debug_assert!(kind.is_request());
        Self {
            tag: Tag::NONE,
            kind,
            fid,
            body,
        }
    }

    /// Builds the empty response skeleton for a request: same tag, paired
    /// response kind, no payload yet.
    #[must_use]
    pub fn response_skeleton(request: &Self) -> Self {
        Self {
            tag: request.tag,
            kind: request.kind.response(),
            fid: None,
            body: Bytes::new(),
        }
    }
}
