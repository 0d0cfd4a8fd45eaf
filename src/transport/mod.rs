//! Connections and the top-level event loop.
//!
//! The socket layer is a collaborator behind the [`Transport`] trait: it
//! blocks until something happens on a socket and delivers either a fully
//! decoded inbound message, a writable notification, or a close. Everything
//! stateful — connection roles, outbound queues, tag correlation — lives in
//! the engine's connection table under the big lock.
//!
//! [`EventLoop::run`] mirrors the server's main loop: drain the error queue
//! (fatally), pull one transport event, and either spawn a dispatch worker
//! for a fresh inbound request or attach a reply to the transaction that was
//! waiting for it.

mod message;

pub use message::{Message, MessageKind};

use crate::dispatch::{dispatch_work, Handlers};
use crate::engine::state::EngineState;
use crate::engine::worker::{Ctx, Engine};
use crate::error::{Error, ErrorKind};
use crate::registry::TransactionRecord;
use crate::types::{ConnId, Tag, TxnId};
use crate::util::Arena;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// What a connection is for, from this envoy's point of view.
///
/// Inbound roles accept requests; outbound roles carry requests we issue.
/// A freshly accepted connection is [`ConnectionRole::UnknownIn`] until
/// version negotiation upgrades it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Accepted, not yet version-negotiated.
    UnknownIn,
    /// A file-protocol client.
    ClientIn,
    /// A peer envoy forwarding requests to us.
    EnvoyIn,
    /// A storage server speaking to us (storage binary only).
    StorageIn,
    /// Our outbound link to a peer envoy.
    EnvoyOut,
    /// Our outbound link to a storage server.
    StorageOut,
}

impl ConnectionRole {
    /// True for roles that accept inbound requests.
    #[must_use]
    pub const fn is_inbound(self) -> bool {
        matches!(
            self,
            Self::UnknownIn | Self::ClientIn | Self::EnvoyIn | Self::StorageIn
        )
    }

    /// True for roles that carry requests we issue.
    #[must_use]
    pub const fn is_outbound(self) -> bool {
        matches!(self, Self::EnvoyOut | Self::StorageOut)
    }
}

/// Per-connection state.
pub(crate) struct ConnectionRecord {
    pub(crate) role: ConnectionRole,
    pub(crate) addr: SocketAddr,
    /// Messages queued for eventual transmission.
    pub(crate) outbound: VecDeque<Message>,
    /// Next candidate tag for outbound requests.
    next_tag: u16,
    /// Outstanding outbound requests by tag.
    pub(crate) correlation: HashMap<Tag, TxnId>,
    /// Tags of inbound requests not yet replied to.
    pub(crate) pending_inbound: HashSet<Tag>,
}

impl ConnectionRecord {
    fn new(role: ConnectionRole, addr: SocketAddr) -> Self {
        Self {
            role,
            addr,
            outbound: VecDeque::new(),
            next_tag: 0,
            correlation: HashMap::new(),
            pending_inbound: HashSet::new(),
        }
    }

    /// Allocates a tag no outstanding transaction on this connection uses.
    pub(crate) fn alloc_tag(&mut self) -> Tag {
        assert!(
            self.correlation.len() < usize::from(u16::MAX) - 1,
            "tag space exhausted on connection to {}",
            self.addr
        );
        loop {
            let candidate = Tag(self.next_tag);
            self.next_tag = self.next_tag.wrapping_add(1);
            if candidate != Tag::NONE && !self.correlation.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

impl core::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("role", &self.role)
            .field("addr", &self.addr)
            .field("queued", &self.outbound.len())
            .field("outstanding", &self.correlation.len())
            .finish_non_exhaustive()
    }
}

/// The connection table: arena records plus an address index for outbound
/// links.
pub(crate) struct ConnectionTable {
    records: Arena<ConnectionRecord>,
    by_addr: HashMap<SocketAddr, ConnId>,
}

impl ConnectionTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arena::with_capacity(capacity),
            by_addr: HashMap::with_capacity(capacity),
        }
    }

    pub(crate) fn insert(&mut self, role: ConnectionRole, addr: SocketAddr) -> ConnId {
        let id = ConnId(self.records.insert(ConnectionRecord::new(role, addr)));
        if role.is_outbound() {
            let evicted = self.by_addr.insert(addr, id);
            assert!(
                evicted.is_none(),
                "second outbound connection to {addr} registered"
            );
        }
        debug!(conn = ?id, ?role, %addr, "connection registered");
        id
    }

    pub(crate) fn remove(&mut self, id: ConnId) -> Option<ConnectionRecord> {
        let record = self.records.remove(id.0)?;
        if record.role.is_outbound() {
            self.by_addr.remove(&record.addr);
        }
        debug!(conn = ?id, addr = %record.addr, "connection removed");
        Some(record)
    }

    pub(crate) fn get(&self, id: ConnId) -> Option<&ConnectionRecord> {
        self.records.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: ConnId) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(id.0)
    }

    /// Finds the outbound connection to `addr`, if one is registered.
    pub(crate) fn outbound_to(&self, addr: SocketAddr) -> Option<ConnId> {
        self.by_addr.get(&addr).copied()
    }
}

impl EngineState {
    /// Queues a message on a connection for eventual transmission, nudging
    /// the transport the first time the queue goes non-empty.
    ///
    /// Messages for connections that have since closed are dropped.
    pub(crate) fn enqueue_outbound(&mut self, conn: ConnId, msg: Message) {
        let Some(record) = self.connections.get_mut(conn) else {
            debug!(conn = ?conn, "message dropped for closed connection");
            return;
        };
        let was_empty = record.outbound.is_empty();
        record.outbound.push_back(msg);
        if was_empty {
            if let Some(notifier) = &self.notifier {
                notifier.outbound_ready(conn);
            }
        }
    }
}

/// One event from the socket collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A fully decoded message arrived on a connection.
    Inbound {
        /// Source connection.
        conn: ConnId,
        /// The decoded message.
        msg: Message,
    },
    /// A connection can accept queued outbound messages.
    Writable {
        /// The writable connection.
        conn: ConnId,
    },
    /// A connection closed.
    Closed {
        /// The closed connection.
        conn: ConnId,
    },
}

/// The consumed socket interface: block for the next event, transmit a
/// message on a writable connection.
pub trait Transport {
    /// Blocks until a socket event is ready.
    fn next_event(&mut self) -> Result<TransportEvent, Error>;

    /// Transmits one message on a connection previously reported writable.
    fn flush(&mut self, conn: ConnId, msg: Message) -> Result<(), Error>;
}

/// Hook the engine uses to nudge a blocked [`Transport::next_event`] when an
/// outbound queue goes non-empty (the select-loop refresh pipe, abstracted).
pub trait TransportNotifier: Send + Sync {
    /// A connection's outbound queue went from empty to non-empty.
    fn outbound_ready(&self, conn: ConnId);
}

impl Engine {
    /// Registers a connection.
    pub fn add_connection(&self, role: ConnectionRole, addr: SocketAddr) -> ConnId {
        self.shared.state.lock().connections.insert(role, addr)
    }

    /// The connection's current role, or `None` once closed.
    #[must_use]
    pub fn connection_role(&self, conn: ConnId) -> Option<ConnectionRole> {
        self.shared
            .state
            .lock()
            .connections
            .get(conn)
            .map(|record| record.role)
    }

    /// Upgrades a connection's role after version negotiation.
    ///
    /// # Panics
    ///
    /// Panics unless the connection is currently [`ConnectionRole::UnknownIn`]
    /// and the new role is inbound.
    pub fn set_connection_role(&self, conn: ConnId, role: ConnectionRole) {
        let mut state = self.shared.state.lock();
        let record = state
            .connections
            .get_mut(conn)
            .expect("upgrading a closed connection");
        assert_eq!(
            record.role,
            ConnectionRole::UnknownIn,
            "role upgrade on an already-negotiated connection"
        );
        assert!(role.is_inbound(), "inbound connections stay inbound");
        debug!(conn = ?conn, ?role, "connection role negotiated");
        record.role = role;
    }

    /// Removes a connection, dropping its queued output. Workers waiting on
    /// replies from this connection will wait forever; abandoning them is
    /// the caller's policy decision, as it is for the protocol itself.
    pub fn close_connection(&self, conn: ConnId) {
        self.shared.state.lock().connections.remove(conn);
    }

    /// Drains the connection's queued outbound messages for transmission.
    #[must_use]
    pub fn take_outbound(&self, conn: ConnId) -> Vec<Message> {
        let mut state = self.shared.state.lock();
        state
            .connections
            .get_mut(conn)
            .map(|record| record.outbound.drain(..).collect())
            .unwrap_or_default()
    }

    /// Installs the transport nudge hook.
    pub fn set_notifier(&self, notifier: Arc<dyn TransportNotifier>) {
        self.shared.state.lock().notifier = Some(notifier);
    }

    /// Delivers one decoded inbound message: spawns a dispatch worker for a
    /// request on an inbound connection, or attaches a reply on an outbound
    /// one. Protocol misuse is posted to the error queue, not returned.
    pub fn deliver(&self, conn: ConnId, msg: Message, handlers: &Arc<dyn Handlers>) {
        let mut state = self.shared.state.lock();
        self.deliver_locked(&mut state, conn, msg, handlers);
    }

    /// Delivers a burst of messages decoded from one socket readable event,
    /// all under a single critical section. Workers awaiting several of the
    /// burst's replies observe them in one resumption, exactly as when
    /// replies race ahead of the scheduler.
    pub fn deliver_burst<I>(&self, conn: ConnId, msgs: I, handlers: &Arc<dyn Handlers>)
    where
        I: IntoIterator<Item = Message>,
    {
        let mut state = self.shared.state.lock();
        for msg in msgs {
            self.deliver_locked(&mut state, conn, msg, handlers);
        }
    }

    fn deliver_locked(
        &self,
        state: &mut EngineState,
        conn: ConnId,
        msg: Message,
        handlers: &Arc<dyn Handlers>,
    ) {
        let Some(record) = state.connections.get(conn) else {
            debug!(conn = ?conn, "message from closed connection dropped");
            return;
        };
        let role = record.role;
        trace!(conn = ?conn, ?role, kind = ?msg.kind, tag = ?msg.tag, "inbound message");

        if role.is_inbound() {
            if !msg.kind.is_request() {
                warn!(conn = ?conn, kind = ?msg.kind, "response arrived on inbound connection");
                state.error_queue.push_back((
                    None,
                    Error::new(ErrorKind::UnexpectedReply).on_conn(conn),
                ));
                return;
            }
            let tag = msg.tag;
            if record.pending_inbound.contains(&tag) {
                warn!(conn = ?conn, ?tag, "inbound request reuses an outstanding tag");
                state.error_queue.push_back((
                    None,
                    Error::new(ErrorKind::TagCollision).on_conn(conn).with_tag(tag),
                ));
                return;
            }
            let txn = state.txns.insert_record(TransactionRecord::inbound(conn, msg));
            state
                .connections
                .get_mut(conn)
                .expect("connection vanished under the lock")
                .pending_inbound
                .insert(tag);
            crate::engine::worker::spawn_locked(
                &self.shared,
                state,
                dispatch_work(txn, Arc::clone(handlers)),
            );
        } else {
            let tag = msg.tag;
            if let Err(err) = state.attach_reply(conn, tag, msg) {
                warn!(conn = ?conn, ?tag, "unmatched reply");
                state.error_queue.push_back((None, err));
            }
        }
    }
}

impl Ctx<'_> {
    /// Finds our outbound connection to a peer envoy.
    #[must_use]
    pub fn envoy_out(&self, addr: SocketAddr) -> Option<ConnId> {
        self.guard.connections.outbound_to(addr)
    }

    /// The connection's current role, or `None` once closed.
    #[must_use]
    pub fn connection_role(&self, conn: ConnId) -> Option<ConnectionRole> {
        self.guard.connections.get(conn).map(|record| record.role)
    }

    /// Upgrades a connection's role after version negotiation (handler-side
    /// counterpart of [`Engine::set_connection_role`]).
    ///
    /// # Panics
    ///
    /// Panics unless the connection is currently [`ConnectionRole::UnknownIn`]
    /// and the new role is inbound.
    pub fn set_connection_role(&mut self, conn: ConnId, role: ConnectionRole) {
        let record = self
            .guard
            .connections
            .get_mut(conn)
            .expect("upgrading a closed connection");
        assert_eq!(
            record.role,
            ConnectionRole::UnknownIn,
            "role upgrade on an already-negotiated connection"
        );
        assert!(role.is_inbound(), "inbound connections stay inbound");
        record.role = role;
    }
}

/// The top-level event loop.
pub struct EventLoop<T: Transport> {
    engine: Engine,
    transport: T,
    handlers: Arc<dyn Handlers>,
}

impl<T: Transport> EventLoop<T> {
    /// Builds an event loop over an engine, a socket collaborator, and the
    /// protocol handlers.
    pub fn new(engine: Engine, transport: T, handlers: Arc<dyn Handlers>) -> Self {
        Self {
            engine,
            transport,
            handlers,
        }
    }

    /// The engine this loop feeds.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Runs until a fatal error. Protocol misuse queued by workers is
    /// fatal by design: it indicates a logic bug elsewhere, and limping on
    /// would corrupt namespace state.
    pub fn run(&mut self) -> Error {
        loop {
            if let Err(err) = self.step() {
                return err;
            }
        }
    }

    /// Processes one transport event.
    pub fn step(&mut self) -> Result<(), Error> {
        if let Some((txn, err)) = self.drain_error() {
            error!(?txn, %err, "unhandled protocol error; halting");
            return Err(err);
        }

        match self.transport.next_event()? {
            TransportEvent::Inbound { conn, msg } => {
                self.engine.deliver(conn, msg, &self.handlers);
            }
            TransportEvent::Writable { conn } => {
                for msg in self.engine.take_outbound(conn) {
                    self.transport.flush(conn, msg)?;
                }
            }
            TransportEvent::Closed { conn } => {
                self.engine.close_connection(conn);
                let handlers = Arc::clone(&self.handlers);
                self.engine
                    .spawn(move |ctx| handlers.connection_closed(ctx, conn));
            }
        }
        Ok(())
    }

    fn drain_error(&self) -> Option<(Option<TxnId>, Error)> {
        self.engine.shared.state.lock().error_queue.pop_front()
    }
}
