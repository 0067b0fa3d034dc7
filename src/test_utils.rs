//! Shared helpers for unit and scenario tests:
//! - One-time tracing initialization wired to the test writer
//! - Scenario start/done markers and a logging assert
//! - Small-runtime constructors
//!
//! # Example
//! ```ignore
//! use melon_fiber::test_utils::{init_test_logging, test_runtime};
//!
//! fn my_test() {
//!     init_test_logging();
//!     let rt = test_runtime(2);
//!     // ...
//!     rt.shutdown();
//! }
//! ```

use crate::config::RuntimeConfig;
use crate::runtime::Runtime;
use std::sync::{Arc, Once};

static INIT_LOGGING: Once = Once::new();

/// Install a trace-level subscriber writing through the test harness.
///
/// Idempotent: every test calls it, the first call wins.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// A runtime with one group of `workers` workers and test-friendly sizes.
#[must_use]
pub fn test_runtime(workers: usize) -> Arc<Runtime> {
    init_test_logging();
    let config = RuntimeConfig::default()
        .workers_per_group(workers)
        .groups(1);
    Runtime::start(config).expect("failed to start test runtime")
}

/// A runtime with a dedicated system group.
#[must_use]
pub fn test_runtime_with_system_group(workers: usize) -> Arc<Runtime> {
    init_test_logging();
    let config = RuntimeConfig::default()
        .workers_per_group(workers)
        .groups(2);
    Runtime::start(config).expect("failed to start test runtime")
}

/// Mark the start of a named scenario in the log stream, so the trace
/// output of one scenario is easy to cut out of a multi-test run.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(scenario = %$name, "---- scenario start: {} ----", $name);
    };
}

/// Mark a scenario as finished, optionally attaching result fields.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(scenario = %$name, "---- scenario done: {} ----", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            scenario = %$name,
            $($key = %$value,)*
            "---- scenario done: {} ----",
            $name
        );
    };
}

/// Assert with the expected/actual pair logged first, so a failing
/// multi-thread test still shows what was compared even when the panic
/// message is swallowed by a worker.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(expected = ?$expected, actual = ?$actual, "checking: {}", $msg);
        assert!(
            $cond,
            "{} (expected {:?}, actual {:?})",
            $msg, $expected, $actual
        );
    };
}
