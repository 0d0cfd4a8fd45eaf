//! End-to-end dispatch: forwarding delegated fids, event-loop correlation,
//! and fatal error-queue draining.

mod common;

use bytes::Bytes;
use common::{test_engine, wait_until, NoHandlers};
use envoy_core::{
    ConnId, ConnectionRole, Ctx, Error, ErrorKind, EventLoop, Fid, ForwardRecord, Handlers,
    Message, MessageKind, Step, Tag, Transport, TransportEvent, TxnId,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn client_addr() -> SocketAddr {
    SocketAddr::from(([10, 2, 0, 1], 40001))
}

fn delegate_addr() -> SocketAddr {
    SocketAddr::from(([10, 2, 0, 2], 5640))
}

/// A scripted socket collaborator: hands out pre-recorded events and logs
/// what it was asked to transmit.
struct ScriptedTransport {
    events: VecDeque<TransportEvent>,
    flushed: Arc<Mutex<Vec<(ConnId, Message)>>>,
}

impl ScriptedTransport {
    fn new(events: impl IntoIterator<Item = TransportEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
            flushed: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Transport for ScriptedTransport {
    fn next_event(&mut self) -> Result<TransportEvent, Error> {
        self.events
            .pop_front()
            .ok_or_else(|| Error::new(ErrorKind::TransportFailed).with_detail("script exhausted"))
    }

    fn flush(&mut self, conn: ConnId, msg: Message) -> Result<(), Error> {
        self.flushed.lock().unwrap().push((conn, msg));
        Ok(())
    }
}

/// A read on a delegated fid is relayed to the delegate envoy and the reply
/// is copied back verbatim under the client's original tag.
#[test]
fn delegated_read_is_forwarded_and_copied_back() {
    let engine = test_engine();
    let noop: Arc<dyn Handlers> = Arc::new(NoHandlers);
    let client = engine.add_connection(ConnectionRole::ClientIn, client_addr());
    let peer = engine.add_connection(ConnectionRole::EnvoyOut, delegate_addr());
    engine.forward_insert(
        client,
        Fid(7),
        ForwardRecord {
            addr: delegate_addr(),
            remote_fid: Fid(42),
        },
    );

    let request = Message {
        tag: Tag(9),
        kind: MessageKind::TRead,
        fid: Some(Fid(7)),
        body: Bytes::from_static(b"offset=0 count=128"),
    };
    engine.deliver(client, request, &noop);

    // The relay goes out with the delegate's fid and a fresh tag.
    let relayed = common::collect_outbound(&engine, peer, 1).remove(0);
    assert_eq!(relayed.kind, MessageKind::TRead);
    assert_eq!(relayed.fid, Some(Fid(42)));
    assert_ne!(relayed.tag, Tag(9));
    assert_eq!(&relayed.body[..], b"offset=0 count=128");

    // The delegate's reply comes back and reaches the client verbatim,
    // under the client's tag.
    let reply = Message {
        tag: relayed.tag,
        kind: MessageKind::RRead,
        fid: None,
        body: Bytes::from_static(b"file contents"),
    };
    engine.deliver(peer, reply, &noop);

    let response = common::collect_outbound(&engine, client, 1).remove(0);
    assert_eq!(response.kind, MessageKind::RRead);
    assert_eq!(response.tag, Tag(9));
    assert_eq!(&response.body[..], b"file contents");

    assert!(engine.drain());
    assert_eq!(engine.transaction_count(), 0);
    assert_eq!(engine.active_count(), 0);
}

/// An undelegated operation goes to the local handler, which replies.
#[test]
fn local_operation_reaches_the_handler_and_replies() {
    struct Echo;
    impl Handlers for Echo {
        fn handle(&self, ctx: &mut Ctx<'_>, txn: TxnId) -> Step {
            let response = ctx.response_mut(txn);
            response.body = Bytes::from_static(b"stat data");
            ctx.reply(txn);
            Ok(())
        }
    }

    let engine = test_engine();
    let handlers: Arc<dyn Handlers> = Arc::new(Echo);
    let client = engine.add_connection(ConnectionRole::ClientIn, client_addr());

    let request = Message {
        tag: Tag(3),
        kind: MessageKind::TStat,
        fid: Some(Fid(1)),
        body: Bytes::new(),
    };
    engine.deliver(client, request, &handlers);

    let response = common::collect_outbound(&engine, client, 1).remove(0);
    assert_eq!(response.kind, MessageKind::RStat);
    assert_eq!(response.tag, Tag(3));
    assert_eq!(&response.body[..], b"stat data");

    assert!(engine.drain());
    assert_eq!(engine.transaction_count(), 0);
}

/// A request illegal for the connection's role halts the event loop when
/// the error queue is drained.
#[test]
fn role_violation_is_fatal_on_drain() {
    let engine = test_engine();
    let client = engine.add_connection(ConnectionRole::ClientIn, client_addr());

    let illegal = Message {
        tag: Tag(1),
        kind: MessageKind::TGrant,
        fid: None,
        body: Bytes::new(),
    };
    let transport = ScriptedTransport::new([TransportEvent::Inbound {
        conn: client,
        msg: illegal,
    }]);
    let mut event_loop = EventLoop::new(engine.clone(), transport, Arc::new(NoHandlers));

    event_loop.step().expect("delivery itself succeeds");
    assert!(engine.drain());

    let err = event_loop
        .step()
        .expect_err("draining the error queue must halt the loop");
    assert_eq!(err.kind(), ErrorKind::RoleViolation);
}

/// A reply nobody asked for is protocol misuse and halts the loop.
#[test]
fn unmatched_reply_is_fatal_on_drain() {
    let engine = test_engine();
    let peer = engine.add_connection(ConnectionRole::EnvoyOut, delegate_addr());

    let stray = Message {
        tag: Tag(77),
        kind: MessageKind::RStat,
        fid: None,
        body: Bytes::new(),
    };
    let transport = ScriptedTransport::new([TransportEvent::Inbound {
        conn: peer,
        msg: stray,
    }]);
    let mut event_loop = EventLoop::new(engine.clone(), transport, Arc::new(NoHandlers));

    event_loop.step().expect("delivery itself succeeds");
    let err = event_loop
        .step()
        .expect_err("a stray reply must halt the loop");
    assert_eq!(err.kind(), ErrorKind::UnexpectedReply);
    assert_eq!(err.tag(), Some(Tag(77)));
}

/// A writable event drains the connection's outbound queue through the
/// socket collaborator.
#[test]
fn writable_event_flushes_queued_messages() {
    let engine = test_engine();
    let peer = engine.add_connection(ConnectionRole::EnvoyOut, delegate_addr());

    let (done_tx, done_rx) = mpsc::channel();
    engine.spawn(move |ctx| {
        let txn = ctx.new_request(peer, common::stat_request());
        ctx.send_request(txn);
        ctx.finish_transaction(txn);
        done_tx.send(()).ok();
        Ok(())
    });
    assert!(wait_until(|| {
        engine.active_count() == 0 && engine.transaction_count() == 1
    }));

    let transport = ScriptedTransport::new([TransportEvent::Writable { conn: peer }]);
    let flushed = Arc::clone(&transport.flushed);
    let mut event_loop = EventLoop::new(engine.clone(), transport, Arc::new(NoHandlers));
    event_loop.step().expect("writable event flushes");

    let sent = flushed.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, peer);
    assert_eq!(sent[0].1.kind, MessageKind::TStat);
    let tag = sent[0].1.tag;
    drop(sent);

    let noop: Arc<dyn Handlers> = Arc::new(NoHandlers);
    engine.deliver(peer, common::stat_reply(tag), &noop);
    done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("waiter should resume after the flushed request is answered");
    assert!(engine.drain());
}

/// A closed connection is torn down and the close handler runs on a worker.
#[test]
fn closed_connection_runs_the_shutdown_handler() {
    struct CloseRecorder(mpsc::Sender<ConnId>);
    impl Handlers for CloseRecorder {
        fn handle(&self, _ctx: &mut Ctx<'_>, txn: TxnId) -> Step {
            panic!("no request expected for {txn:?}");
        }
        fn connection_closed(&self, _ctx: &mut Ctx<'_>, conn: ConnId) -> Step {
            self.0.send(conn).ok();
            Ok(())
        }
    }

    let engine = test_engine();
    let client = engine.add_connection(ConnectionRole::ClientIn, client_addr());
    let (closed_tx, closed_rx) = mpsc::channel();

    let transport = ScriptedTransport::new([TransportEvent::Closed { conn: client }]);
    let mut event_loop = EventLoop::new(
        engine.clone(),
        transport,
        Arc::new(CloseRecorder(closed_tx)),
    );
    event_loop.step().expect("close event processed");

    let closed = closed_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("shutdown handler should run");
    assert_eq!(closed, client);
    assert_eq!(engine.connection_role(client), None);
    assert!(engine.drain());
}

/// Version negotiation upgrades an unknown connection, after which client
/// traffic is routed normally.
#[test]
fn version_negotiation_upgrades_the_connection() {
    struct Negotiator;
    impl Handlers for Negotiator {
        fn handle(&self, ctx: &mut Ctx<'_>, txn: TxnId) -> Step {
            let (conn, kind) = {
                let record = ctx.transaction(txn).unwrap();
                (record.conn(), record.inbound_message().unwrap().kind)
            };
            if kind == MessageKind::TVersion {
                ctx.set_connection_role(conn, ConnectionRole::ClientIn);
            }
            ctx.reply(txn);
            Ok(())
        }
    }

    let engine = test_engine();
    let handlers: Arc<dyn Handlers> = Arc::new(Negotiator);
    let conn = engine.add_connection(ConnectionRole::UnknownIn, client_addr());

    let version = Message {
        tag: Tag(0),
        kind: MessageKind::TVersion,
        fid: None,
        body: Bytes::from_static(b"9P2000.envoy"),
    };
    engine.deliver(conn, version, &handlers);
    let response = common::collect_outbound(&engine, conn, 1).remove(0);
    assert_eq!(response.kind, MessageKind::RVersion);
    assert_eq!(engine.connection_role(conn), Some(ConnectionRole::ClientIn));

    // Client traffic is now legal.
    let attach = Message {
        tag: Tag(1),
        kind: MessageKind::TAttach,
        fid: None,
        body: Bytes::new(),
    };
    engine.deliver(conn, attach, &handlers);
    let response = common::collect_outbound(&engine, conn, 1).remove(0);
    assert_eq!(response.kind, MessageKind::RAttach);
    assert!(engine.drain());
}
