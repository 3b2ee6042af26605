// SPDX-License-Identifier: MIT OR Apache-2.0

use env_logger::Env;

/// Initialise `env_logger` once, honouring `RUST_LOG` (default `info`).
///
/// Safe to call repeatedly; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Test variant: captured by the test harness, defaults to `debug`.
pub fn init_test_logging() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
