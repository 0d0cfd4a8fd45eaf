//! The transaction registry: request/reply correlation and reply waits.
//!
//! A transaction pairs one request with its eventual reply. Outbound
//! transactions are registered under a fresh connection-scoped tag at send
//! time and removed the instant the event loop consumes that tag; inbound
//! transactions hold the request while a dispatch worker computes the
//! response.
//!
//! Reply waits sleep in place on a condvar tied to the big lock — they do
//! *not* unwind, because a worker awaiting a reply deliberately keeps its
//! locks across the wait. The active-worker count is handed off instead:
//! the waiter decrements it before sleeping and the reply deliverer
//! increments it when signalling, so a parked waiter never occupies an
//! execution slot. Batch waits absorb coalesced wakeups — several replies
//! may land before the waiter runs again — by recomputing, on every wake,
//! how many transactions completed and settling the count for the wakeups
//! that never happened.

use crate::engine::state::EngineState;
use crate::engine::worker::{Ctx, Engine};
use crate::error::{Error, ErrorKind};
use crate::transport::Message;
use crate::types::{ConnId, Tag, TxnId};
use crate::util::Arena;
use parking_lot::Condvar;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One request/reply unit.
pub struct TransactionRecord {
    conn: ConnId,
    /// The message we send: the request (outbound transactions) or the
    /// response under construction (inbound ones).
    pub(crate) outbound: Option<Message>,
    /// The message we received: the reply (outbound transactions) or the
    /// original request (inbound ones).
    pub(crate) inbound: Option<Message>,
    /// Wake condition for the worker awaiting the reply; shared across a
    /// batch when several requests are issued together.
    pub(crate) wait: Option<Arc<Condvar>>,
    /// Whether the response of an inbound transaction has been transmitted.
    pub(crate) replied: bool,
}

impl TransactionRecord {
    /// A transaction wrapping an inbound request.
    #[must_use]
    pub fn inbound(conn: ConnId, request: Message) -> Self {
        Self {
            conn,
            outbound: None,
            inbound: Some(request),
            wait: None,
            replied: false,
        }
    }

    /// A transaction wrapping a request we will send.
    #[must_use]
    pub fn outbound(conn: ConnId, request: Message) -> Self {
        Self {
            conn,
            outbound: Some(request),
            inbound: None,
            wait: None,
            replied: false,
        }
    }

    /// The owning connection.
    #[must_use]
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    /// The received message: reply, or original request.
    #[must_use]
    pub fn inbound_message(&self) -> Option<&Message> {
        self.inbound.as_ref()
    }

    /// The message to transmit: request, or response under construction.
    #[must_use]
    pub fn outbound_message(&self) -> Option<&Message> {
        self.outbound.as_ref()
    }
}

impl core::fmt::Debug for TransactionRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransactionRecord")
            .field("conn", &self.conn)
            .field("has_outbound", &self.outbound.is_some())
            .field("has_inbound", &self.inbound.is_some())
            .field("awaited", &self.wait.is_some())
            .finish()
    }
}

/// Arena of live transactions.
pub(crate) struct TransactionTable {
    records: Arena<TransactionRecord>,
}

impl TransactionTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arena::with_capacity(capacity),
        }
    }

    pub(crate) fn insert_record(&mut self, record: TransactionRecord) -> TxnId {
        TxnId(self.records.insert(record))
    }

    pub(crate) fn get(&self, id: TxnId) -> Option<&TransactionRecord> {
        self.records.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: TxnId) -> Option<&mut TransactionRecord> {
        self.records.get_mut(id.0)
    }

    pub(crate) fn remove(&mut self, id: TxnId) -> Option<TransactionRecord> {
        self.records.remove(id.0)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

impl EngineState {
    /// Attaches a reply to the transaction registered under `tag`, removing
    /// the registry entry and waking the waiter.
    ///
    /// The active count is incremented here, once per reply: the waiting
    /// worker decremented it before sleeping, and batch waiters settle any
    /// surplus from coalesced wakeups themselves.
    ///
    /// # Panics
    ///
    /// Panics if the transaction already has a reply or nobody awaits it —
    /// both prove the tag-uniqueness invariant was broken internally.
    pub(crate) fn attach_reply(
        &mut self,
        conn: ConnId,
        tag: Tag,
        msg: Message,
    ) -> Result<(), Error> {
        let Some(record) = self.connections.get_mut(conn) else {
            return Err(Error::new(ErrorKind::ConnectionClosed).on_conn(conn));
        };
        let Some(txn) = record.correlation.remove(&tag) else {
            return Err(Error::new(ErrorKind::UnexpectedReply)
                .on_conn(conn)
                .with_tag(tag));
        };
        let wait = {
            let record = self
                .txns
                .get_mut(txn)
                .expect("correlated transaction vanished");
            assert!(
                record.inbound.is_none(),
                "second reply attached to transaction {txn:?}"
            );
            record.inbound = Some(msg);
            record.wait.clone()
        };
        trace!(?txn, ?tag, "reply attached");

        self.active += 1;
        wait.expect("reply arrived for a transaction nobody awaits")
            .notify_one();
        Ok(())
    }
}

impl Engine {
    /// Number of live transactions, for observability.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.shared.state.lock().txns.len()
    }
}

impl Ctx<'_> {
    /// Creates an unsent outbound transaction carrying `request`.
    pub fn new_request(&mut self, conn: ConnId, request: Message) -> TxnId {
        debug_assert!(request.kind.is_request());
        self.guard
            .txns
            .insert_record(TransactionRecord::outbound(conn, request))
    }

    /// Reads a transaction record.
    #[must_use]
    pub fn transaction(&self, txn: TxnId) -> Option<&TransactionRecord> {
        self.guard.txns.get(txn)
    }

    /// Builds (or rebuilds) the response skeleton for an inbound
    /// transaction: the request's tag, the paired response kind, an empty
    /// body. Rebuilding on every dispatch attempt is what makes re-running
    /// a suspended work item safe — nothing a discarded attempt wrote into
    /// the response survives.
    ///
    /// # Panics
    ///
    /// Panics if the transaction has no request.
    pub fn build_response(&mut self, txn: TxnId) {
        let record = self
            .guard
            .txns
            .get_mut(txn)
            .expect("stale transaction handle");
        let request = record
            .inbound
            .as_ref()
            .expect("building a response with no request");
        record.outbound = Some(Message::response_skeleton(request));
    }

    /// The response message under construction for an inbound transaction.
    ///
    /// # Panics
    ///
    /// Panics if no response skeleton has been built yet.
    pub fn response_mut(&mut self, txn: TxnId) -> &mut Message {
        self.guard
            .txns
            .get_mut(txn)
            .expect("stale transaction handle")
            .outbound
            .as_mut()
            .expect("transaction has no response under construction")
    }

    /// Takes the reply off a completed outbound transaction.
    ///
    /// # Panics
    ///
    /// Panics if no reply is attached.
    pub fn take_reply(&mut self, txn: TxnId) -> Message {
        self.guard
            .txns
            .get_mut(txn)
            .expect("stale transaction handle")
            .inbound
            .take()
            .expect("taking a reply that never arrived")
    }

    /// Sends an outbound request and parks until its reply arrives.
    ///
    /// The transaction is registered under a fresh tag and the request is
    /// queued for transmission; this worker then sleeps, with its locks
    /// intact, until the event loop attaches the reply. On return the reply
    /// is present and the transaction is no longer registered.
    ///
    /// # Panics
    ///
    /// Panics on misuse: a non-outbound connection, a transaction that
    /// already has a reply, or one already being awaited.
    pub fn send_request(&mut self, txn: TxnId) {
        let wait = Arc::new(Condvar::new());
        self.register_and_queue(txn, &wait);

        // Hand our execution slot back while we wait; the reply deliverer
        // returns it when it signals.
        self.guard.active -= 1;
        while self
            .guard
            .txns
            .get(txn)
            .expect("stale transaction handle")
            .inbound
            .is_none()
        {
            self.sleep_on(&wait);
        }
        self.guard
            .txns
            .get_mut(txn)
            .expect("stale transaction handle")
            .wait = None;
        trace!(?txn, "reply received");
    }

    /// Sends a batch of outbound requests under one shared wake condition
    /// and parks until every one of them has a reply.
    ///
    /// Replies can race ahead of the waiter: several may arrive (each
    /// incrementing the active count and signalling) before this worker runs
    /// again, with the signals coalescing into a single wakeup. Each wake
    /// therefore rescans the batch, clears the wait handle of every newly
    /// completed transaction, and settles the active count for the wakeups
    /// it absorbed on the group's behalf.
    ///
    /// # Panics
    ///
    /// Panics on an empty batch or on any per-transaction misuse, as in
    /// [`Ctx::send_request`].
    pub fn send_request_batch(&mut self, txns: &[TxnId]) {
        assert!(!txns.is_empty(), "empty request batch");
        let wait = Arc::new(Condvar::new());
        for &txn in txns {
            self.register_and_queue(txn, &wait);
        }
        let mut remaining = txns.len();
        debug!(count = remaining, "request batch issued");

        while remaining > 0 {
            self.guard.active -= 1;
            self.sleep_on(&wait);
            // One increment for the wakeup we actually consumed; the scan
            // below subtracts one per completed transaction, cancelling the
            // deliverers' increments for wakeups that coalesced into this
            // one.
            self.guard.active += 1;
            for &txn in txns {
                let record = self
                    .guard
                    .txns
                    .get_mut(txn)
                    .expect("stale transaction handle");
                if record.inbound.is_some() && record.wait.is_some() {
                    record.wait = None;
                    remaining -= 1;
                    self.guard.active -= 1;
                }
            }
            trace!(remaining, "batch wake processed");
        }
    }

    /// Transmits the computed response of an inbound transaction. Valid
    /// once per transaction.
    ///
    /// # Panics
    ///
    /// Panics if the transaction has no request, no response, or was
    /// already replied to.
    pub fn reply(&mut self, txn: TxnId) {
        let (conn, msg) = {
            let record = self.guard.txns.get_mut(txn).expect("stale transaction handle");
            assert!(
                record.inbound.is_some(),
                "replying to a transaction with no request"
            );
            assert!(!record.replied, "second reply for transaction {txn:?}");
            record.replied = true;
            let msg = record
                .outbound
                .clone()
                .expect("replying with no response message");
            (record.conn, msg)
        };
        let Some(connection) = self.guard.connections.get_mut(conn) else {
            debug!(?txn, "reply dropped for closed connection");
            return;
        };
        assert!(
            connection.role.is_inbound(),
            "reply on an outbound connection"
        );
        let released = connection.pending_inbound.remove(&msg.tag);
        debug_assert!(released, "inbound tag released before its reply");
        trace!(?txn, tag = ?msg.tag, "reply queued");
        self.guard.enqueue_outbound(conn, msg);
    }

    /// Posts a transaction that cannot be completed normally to the
    /// process-wide error queue, drained (fatally) by the event loop.
    pub fn post_error(&mut self, txn: TxnId, error: Error) {
        warn!(?txn, %error, "transaction posted to error queue");
        self.guard.error_queue.push_back((Some(txn), error));
    }

    /// Destroys a transaction record once its work item is done with it.
    ///
    /// An inbound transaction that was never replied to releases its
    /// pending tag here so the client may legally reuse it.
    pub fn finish_transaction(&mut self, txn: TxnId) {
        let Some(record) = self.guard.txns.remove(txn) else {
            return;
        };
        debug_assert!(
            record.wait.is_none(),
            "finishing a transaction still being awaited"
        );
        if record.replied {
            return;
        }
        if let Some(request) = &record.inbound {
            if let Some(connection) = self.guard.connections.get_mut(record.conn) {
                if connection.role.is_inbound() {
                    connection.pending_inbound.remove(&request.tag);
                }
            }
        }
    }

    fn register_and_queue(&mut self, txn: TxnId, wait: &Arc<Condvar>) {
        let conn = {
            let record = self.guard.txns.get_mut(txn).expect("stale transaction handle");
            assert!(
                record.inbound.is_none(),
                "sending a transaction that already has a reply"
            );
            assert!(
                record.wait.is_none(),
                "transaction is already being awaited"
            );
            record.wait = Some(Arc::clone(wait));
            record.conn
        };
        let connection = self
            .guard
            .connections
            .get_mut(conn)
            .expect("sending on a closed connection");
        assert!(
            connection.role.is_outbound(),
            "send_request on an inbound connection"
        );
        let tag = connection.alloc_tag();
        let evicted = connection.correlation.insert(tag, txn);
        debug_assert!(evicted.is_none(), "tag allocator returned a live tag");

        let msg = {
            let record = self.guard.txns.get_mut(txn).expect("stale transaction handle");
            let msg = record
                .outbound
                .as_mut()
                .expect("outbound transaction with no request message");
            msg.tag = tag;
            msg.clone()
        };
        trace!(?txn, ?tag, "request registered");
        self.guard.enqueue_outbound(conn, msg);
    }
}
