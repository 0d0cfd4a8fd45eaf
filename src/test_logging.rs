//! Lightweight, self-contained logging for the test suites.
//!
//! Tests log through the [`test_phase!`], [`test_complete!`], and
//! [`assert_with_log!`] macros so a failing run leaves a narrated trail of
//! what the test had established before the failing check. Verbosity comes
//! from the `TEST_LOG_LEVEL` environment variable (`error`, `warn`, `info`,
//! `debug`, `trace`); the default prints phase markers only.

use std::fmt;
use std::io::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Once, OnceLock};
use std::time::Instant;

/// Verbosity for test logging, least to most verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestLogLevel {
    /// Failures only.
    Error,
    /// Warnings and above.
    Warn,
    /// Phase markers and test progress.
    #[default]
    Info,
    /// Per-assertion detail.
    Debug,
    /// Everything.
    Trace,
}

impl TestLogLevel {
    /// Short name used in output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Reads the level from `TEST_LOG_LEVEL`, defaulting to `Info`.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("TEST_LOG_LEVEL")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => Self::Info,
        }
    }
}

static INIT: Once = Once::new();
static LEVEL: AtomicU8 = AtomicU8::new(2);
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Initializes test logging once per process. Safe to call from every test.
pub fn init_test_logging() {
    INIT.call_once(|| {
        LEVEL.store(TestLogLevel::from_env() as u8, Ordering::Relaxed);
        EPOCH.get_or_init(Instant::now);
    });
}

/// True when `level` would be printed.
#[must_use]
pub fn enabled(level: TestLogLevel) -> bool {
    (level as u8) <= LEVEL.load(Ordering::Relaxed)
}

/// Writes one log line with a time offset from process start.
pub fn log(level: TestLogLevel, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(
        out,
        "[{:>9.3?} {:5}] {}",
        elapsed,
        level.name(),
        args
    );
}

/// Marks the start of a test or test phase.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::test_logging::log(
            $crate::test_logging::TestLogLevel::Info,
            format_args!("=== {} ===", $name),
        )
    };
}

/// Marks a test as finished.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::test_logging::log(
            $crate::test_logging::TestLogLevel::Info,
            format_args!("--- {} complete ---", $name),
        )
    };
}

/// Asserts with a narrated expected/actual pair on failure.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $what:expr, $expected:expr, $actual:expr) => {{
        if $cond {
            $crate::test_logging::log(
                $crate::test_logging::TestLogLevel::Debug,
                format_args!("ok: {} ({:?})", $what, $actual),
            );
        } else {
            $crate::test_logging::log(
                $crate::test_logging::TestLogLevel::Error,
                format_args!(
                    "FAILED: {} — expected {:?}, got {:?}",
                    $what, $expected, $actual
                ),
            );
            panic!("{}: expected {:?}, got {:?}", $what, $expected, $actual);
        }
    }};
}
