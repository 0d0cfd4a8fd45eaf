//! Request routing: forward-or-handle.
//!
//! Dispatch is deliberately thin. For each inbound request it builds the
//! response skeleton, checks legality against the connection's role, and
//! either forwards the request to the envoy the addressed object has been
//! delegated to or invokes the protocol handler. The handlers themselves —
//! the per-operation filesystem semantics — are a collaborator behind the
//! [`Handlers`] trait.
//!
//! Requests illegal for a connection's role are posted to the error queue
//! rather than handled; the event loop treats a non-empty error queue as
//! fatal.

use crate::engine::suspend::Step;
use crate::engine::worker::{Ctx, Engine, WorkItem};
use crate::error::{Error, ErrorKind};
use crate::transport::{ConnectionRole, MessageKind};
use crate::types::{ConnId, Fid, Tag, TxnId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The seam to protocol-handler code.
///
/// Handlers receive the context and the routed transaction, compute the
/// operation, fill the response via [`Ctx::response_mut`], and transmit it
/// with [`Ctx::reply`]. They are re-run from the top after any suspension,
/// so they must be idempotent from entry.
pub trait Handlers: Send + Sync {
    /// Executes one routed request.
    fn handle(&self, ctx: &mut Ctx<'_>, txn: TxnId) -> Step;

    /// A connection closed; release whatever client state it anchored.
    fn connection_closed(&self, _ctx: &mut Ctx<'_>, _conn: ConnId) -> Step {
        Ok(())
    }
}

/// Where a delegated fid now lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardRecord {
    /// The envoy the object was delegated to.
    pub addr: SocketAddr,
    /// The fid our session on that envoy uses for the object.
    pub remote_fid: Fid,
}

/// Forwarding lookups keyed by (connection, fid).
#[derive(Debug, Default)]
pub(crate) struct ForwardTable {
    map: HashMap<(ConnId, Fid), ForwardRecord>,
}

impl ForwardTable {
    pub(crate) fn insert(&mut self, conn: ConnId, fid: Fid, record: ForwardRecord) {
        debug!(?conn, ?fid, addr = %record.addr, "fid delegated");
        self.map.insert((conn, fid), record);
    }

    pub(crate) fn remove(&mut self, conn: ConnId, fid: Fid) -> Option<ForwardRecord> {
        self.map.remove(&(conn, fid))
    }

    pub(crate) fn lookup(&self, conn: ConnId, fid: Fid) -> Option<ForwardRecord> {
        self.map.get(&(conn, fid)).copied()
    }
}

impl Engine {
    /// Records that a client fid has been delegated to another envoy.
    pub fn forward_insert(&self, conn: ConnId, fid: Fid, record: ForwardRecord) {
        self.shared.state.lock().forwards.insert(conn, fid, record);
    }

    /// Removes a delegation record.
    pub fn forward_remove(&self, conn: ConnId, fid: Fid) -> Option<ForwardRecord> {
        self.shared.state.lock().forwards.remove(conn, fid)
    }

    /// Looks up where a fid has been delegated, if anywhere.
    #[must_use]
    pub fn forward_lookup(&self, conn: ConnId, fid: Fid) -> Option<ForwardRecord> {
        self.shared.state.lock().forwards.lookup(conn, fid)
    }
}

impl Ctx<'_> {
    /// Records that a client fid has been delegated to another envoy.
    pub fn forward_insert(&mut self, conn: ConnId, fid: Fid, record: ForwardRecord) {
        self.guard.forwards.insert(conn, fid, record);
    }

    /// Removes a delegation record.
    pub fn forward_remove(&mut self, conn: ConnId, fid: Fid) -> Option<ForwardRecord> {
        self.guard.forwards.remove(conn, fid)
    }

    /// Looks up where a fid has been delegated, if anywhere.
    #[must_use]
    pub fn forward_lookup(&self, conn: ConnId, fid: Fid) -> Option<ForwardRecord> {
        self.guard.forwards.lookup(conn, fid)
    }
}

/// Wraps a dispatched transaction as a work item that destroys the
/// transaction when the item completes.
pub(crate) fn dispatch_work(txn: TxnId, handlers: Arc<dyn Handlers>) -> WorkItem {
    Arc::new(move |ctx: &mut Ctx<'_>| {
        dispatch(ctx, txn, handlers.as_ref())?;
        ctx.finish_transaction(txn);
        Ok(())
    })
}

/// Routes one inbound request.
///
/// Safe to re-run from the top: the response skeleton is rebuilt on every
/// attempt, overwriting anything a discarded attempt left behind.
pub fn dispatch(ctx: &mut Ctx<'_>, txn: TxnId, handlers: &dyn Handlers) -> Step {
    let (conn, kind, fid) = {
        let Some(record) = ctx.transaction(txn) else {
            return Ok(());
        };
        let request = record
            .inbound_message()
            .expect("dispatching a transaction with no request");
        (record.conn(), request.kind, request.fid)
    };
    let Some(role) = ctx.connection_role(conn) else {
        // The connection closed under us; nobody is left to answer.
        return Ok(());
    };
    ctx.build_response(txn);
    trace!(?txn, ?conn, ?role, ?kind, "dispatching");

    match role {
        ConnectionRole::UnknownIn => {
            if kind == MessageKind::TVersion {
                handlers.handle(ctx, txn)
            } else {
                reject(ctx, txn, conn, "request before version negotiation")
            }
        }
        ConnectionRole::ClientIn => match kind {
            k if k.is_fid_addressed() => {
                let Some(fid) = fid else {
                    warn!(?txn, ?kind, "fid-addressed request without a fid");
                    ctx.post_error(txn, Error::new(ErrorKind::BadRequest).on_conn(conn));
                    return Ok(());
                };
                if ctx.forward_lookup(conn, fid).is_some() {
                    forward_to_envoy(ctx, txn)
                } else {
                    handlers.handle(ctx, txn)
                }
            }
            MessageKind::TAttach | MessageKind::TAuth | MessageKind::TFlush
            | MessageKind::TWalk => handlers.handle(ctx, txn),
            _ => reject(ctx, txn, conn, "request illegal from a client"),
        },
        ConnectionRole::EnvoyIn | ConnectionRole::StorageIn => {
            // Already forwarded once, or storage traffic: straight to the
            // handler, admin operations included.
            if kind == MessageKind::TVersion {
                reject(ctx, txn, conn, "re-negotiation on an established connection")
            } else {
                handlers.handle(ctx, txn)
            }
        }
        ConnectionRole::EnvoyOut | ConnectionRole::StorageOut => {
            reject(ctx, txn, conn, "request arrived on an outbound connection")
        }
    }
}

fn reject(ctx: &mut Ctx<'_>, txn: TxnId, conn: ConnId, detail: &'static str) -> Step {
    warn!(?txn, ?conn, detail, "request rejected");
    ctx.post_error(
        txn,
        Error::new(ErrorKind::RoleViolation)
            .on_conn(conn)
            .with_detail(detail),
    );
    Ok(())
}

/// Relays a request whose fid has been delegated to another envoy and
/// copies the reply back verbatim under the client's original tag.
pub fn forward_to_envoy(ctx: &mut Ctx<'_>, txn: TxnId) -> Step {
    let (conn, request) = {
        let record = ctx.transaction(txn).expect("stale transaction handle");
        let request = record
            .inbound_message()
            .expect("forwarding a transaction with no request")
            .clone();
        (record.conn(), request)
    };
    let fid = request.fid.expect("forwarded operation carries a fid");
    let forward = ctx
        .forward_lookup(conn, fid)
        .expect("forward entry vanished under the big lock");
    let Some(out_conn) = ctx.envoy_out(forward.addr) else {
        warn!(?txn, addr = %forward.addr, "no connection to delegate envoy");
        ctx.post_error(
            txn,
            Error::new(ErrorKind::NoRouteToDelegate).on_conn(conn),
        );
        return Ok(());
    };

    let mut relayed = request;
    relayed.tag = Tag::NONE;
    relayed.fid = Some(forward.remote_fid);
    let relay = ctx.new_request(out_conn, relayed);
    debug!(?txn, ?relay, addr = %forward.addr, "forwarding to delegate");
    ctx.send_request(relay);

    let reply = ctx.take_reply(relay);
    ctx.finish_transaction(relay);

    let response = ctx.response_mut(txn);
    response.kind = reply.kind;
    response.fid = reply.fid;
    response.body = reply.body;
    ctx.reply(txn);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TransactionRecord;
    use crate::test_logging::init_test_logging;
    use crate::transport::Message;
    use crate::types::WorkerId;
    use crate::{EngineConfig, EngineProfile};
    use bytes::Bytes;
    use parking_lot::Mutex;

    fn engine() -> Engine {
        init_test_logging();
        Engine::new(EngineConfig::from_profile(EngineProfile::Testing))
            .expect("test config is valid")
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 3], port))
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(TxnId, MessageKind)>>,
    }

    impl Handlers for Recording {
        fn handle(&self, ctx: &mut Ctx<'_>, txn: TxnId) -> Step {
            let kind = ctx
                .transaction(txn)
                .unwrap()
                .inbound_message()
                .unwrap()
                .kind;
            self.seen.lock().push((txn, kind));
            Ok(())
        }
    }

    struct Setup {
        engine: Engine,
        conn: ConnId,
        worker: WorkerId,
    }

    fn setup(role: ConnectionRole) -> Setup {
        let engine = engine();
        let conn = engine.add_connection(role, addr(564));
        let worker = engine.shared.state.lock().create_worker(None);
        Setup {
            engine,
            conn,
            worker,
        }
    }

    fn inject(setup: &Setup, kind: MessageKind, fid: Option<Fid>) -> TxnId {
        let mut state = setup.engine.shared.state.lock();
        let msg = Message {
            tag: Tag(1),
            kind,
            fid,
            body: Bytes::new(),
        };
        state
            .txns
            .insert_record(TransactionRecord::inbound(setup.conn, msg))
    }

    fn run_dispatch(setup: &Setup, txn: TxnId, handlers: &Recording) -> Step {
        let mut ctx = Ctx {
            shared: &setup.engine.shared,
            guard: setup.engine.shared.state.lock(),
            worker: setup.worker,
        };
        dispatch(&mut ctx, txn, handlers)
    }

    fn error_queue_kinds(engine: &Engine) -> Vec<ErrorKind> {
        engine
            .shared
            .state
            .lock()
            .error_queue
            .iter()
            .map(|(_, err)| err.kind())
            .collect()
    }

    #[test]
    fn version_is_the_only_request_before_negotiation() {
        let setup = setup(ConnectionRole::UnknownIn);
        let handlers = Recording::default();

        let version = inject(&setup, MessageKind::TVersion, None);
        assert_eq!(run_dispatch(&setup, version, &handlers), Ok(()));
        assert_eq!(handlers.seen.lock().len(), 1);

        let open = inject(&setup, MessageKind::TOpen, Some(Fid(1)));
        assert_eq!(run_dispatch(&setup, open, &handlers), Ok(()));
        assert_eq!(handlers.seen.lock().len(), 1);
        assert_eq!(error_queue_kinds(&setup.engine), vec![ErrorKind::RoleViolation]);
    }

    #[test]
    fn undelegated_fid_operation_is_handled_locally() {
        let setup = setup(ConnectionRole::ClientIn);
        let handlers = Recording::default();

        let txn = inject(&setup, MessageKind::TRead, Some(Fid(7)));
        assert_eq!(run_dispatch(&setup, txn, &handlers), Ok(()));
        assert_eq!(handlers.seen.lock().as_slice(), &[(txn, MessageKind::TRead)]);
        assert!(error_queue_kinds(&setup.engine).is_empty());
    }

    #[test]
    fn delegated_fid_without_route_posts_error() {
        let setup = setup(ConnectionRole::ClientIn);
        let handlers = Recording::default();
        setup.engine.forward_insert(
            setup.conn,
            Fid(7),
            ForwardRecord {
                addr: addr(565),
                remote_fid: Fid(90),
            },
        );

        let txn = inject(&setup, MessageKind::TRead, Some(Fid(7)));
        assert_eq!(run_dispatch(&setup, txn, &handlers), Ok(()));
        assert!(handlers.seen.lock().is_empty());
        assert_eq!(
            error_queue_kinds(&setup.engine),
            vec![ErrorKind::NoRouteToDelegate]
        );
    }

    #[test]
    fn admin_requests_are_illegal_from_clients() {
        let setup = setup(ConnectionRole::ClientIn);
        let handlers = Recording::default();

        let txn = inject(&setup, MessageKind::TGrant, None);
        assert_eq!(run_dispatch(&setup, txn, &handlers), Ok(()));
        assert!(handlers.seen.lock().is_empty());
        assert_eq!(error_queue_kinds(&setup.engine), vec![ErrorKind::RoleViolation]);
    }

    #[test]
    fn envoy_connections_take_admin_and_forwarded_requests_directly() {
        let setup = setup(ConnectionRole::EnvoyIn);
        let handlers = Recording::default();

        // Even a fid-addressed operation skips the forward table here: it
        // was already forwarded once.
        setup.engine.forward_insert(
            setup.conn,
            Fid(7),
            ForwardRecord {
                addr: addr(565),
                remote_fid: Fid(90),
            },
        );
        let read = inject(&setup, MessageKind::TRead, Some(Fid(7)));
        let grant = inject(&setup, MessageKind::TGrant, None);
        assert_eq!(run_dispatch(&setup, read, &handlers), Ok(()));
        assert_eq!(run_dispatch(&setup, grant, &handlers), Ok(()));
        assert_eq!(
            handlers.seen.lock().as_slice(),
            &[(read, MessageKind::TRead), (grant, MessageKind::TGrant)]
        );
    }

    #[test]
    fn fid_addressed_request_without_fid_is_bad() {
        let setup = setup(ConnectionRole::ClientIn);
        let handlers = Recording::default();

        let txn = inject(&setup, MessageKind::TRead, None);
        assert_eq!(run_dispatch(&setup, txn, &handlers), Ok(()));
        assert_eq!(error_queue_kinds(&setup.engine), vec![ErrorKind::BadRequest]);
    }

    #[test]
    fn dispatch_builds_a_response_skeleton() {
        let setup = setup(ConnectionRole::ClientIn);
        let handlers = Recording::default();

        let txn = inject(&setup, MessageKind::TStat, Some(Fid(2)));
        assert_eq!(run_dispatch(&setup, txn, &handlers), Ok(()));
        let state = setup.engine.shared.state.lock();
        let response = state.txns.get(txn).unwrap().outbound_message().unwrap();
        assert_eq!(response.kind, MessageKind::RStat);
        assert_eq!(response.tag, Tag(1));
    }

    #[test]
    fn forward_table_lifecycle() {
        let engine = engine();
        let conn = ConnId::new_for_test(0, 0);
        let record = ForwardRecord {
            addr: addr(565),
            remote_fid: Fid(9),
        };
        engine.forward_insert(conn, Fid(1), record);
        assert_eq!(engine.forward_lookup(conn, Fid(1)), Some(record));
        assert_eq!(engine.forward_remove(conn, Fid(1)), Some(record));
        assert_eq!(engine.forward_lookup(conn, Fid(1)), None);
    }
}
