//! Shared helpers for the integration suites.
#![allow(dead_code)]

use bytes::Bytes;
use envoy_core::{
    Ctx, Engine, EngineConfig, EngineProfile, Handlers, Message, MessageKind, Step, Tag, TxnId,
};
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Initializes both the crate's test logger and a tracing subscriber so
/// engine trace output lands in the captured test output.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
    envoy_core::test_logging::init_test_logging();
}

/// An engine on the testing profile (tiny worker lifetime, small tables).
pub fn test_engine() -> Engine {
    init_test_logging();
    Engine::new(EngineConfig::from_profile(EngineProfile::Testing))
        .expect("testing profile validates")
}

/// Polls `condition` until it holds or two seconds pass.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Drains the connection's outbound queue until `count` messages have been
/// collected, waiting for workers to queue them.
pub fn collect_outbound(engine: &Engine, conn: envoy_core::ConnId, count: usize) -> Vec<Message> {
    let mut collected = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while collected.len() < count && Instant::now() < deadline {
        collected.extend(engine.take_outbound(conn));
        if collected.len() < count {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    assert_eq!(
        collected.len(),
        count,
        "expected {count} outbound messages, saw {}",
        collected.len()
    );
    collected
}

/// Handlers that must never be invoked; used where routing alone is under
/// test.
pub struct NoHandlers;

impl Handlers for NoHandlers {
    fn handle(&self, _ctx: &mut Ctx<'_>, txn: TxnId) -> Step {
        panic!("no handler expected for transaction {txn:?}");
    }
}

/// A stat request with no payload.
pub fn stat_request() -> Message {
    Message::request(MessageKind::TStat, None, Bytes::new())
}

/// The stat reply matching `tag`.
pub fn stat_reply(tag: Tag) -> Message {
    Message {
        tag,
        kind: MessageKind::RStat,
        fid: None,
        body: Bytes::new(),
    }
}
