// SPDX-License-Identifier: GPL-3.0-only

//! Log subscriber setup
//!
//! Set the RUST_LOG environment variable to control the level,
//! e.g. `RUST_LOG=debug` or `RUST_LOG=photo_finisher=debug`.

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber (defaults to `warn`)
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();
}

/// Subscriber for tests; safe to call from every test
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
