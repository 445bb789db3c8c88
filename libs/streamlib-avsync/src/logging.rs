// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Subscriber setup for hosts that do not install their own.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a stderr subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"streamlib_avsync=info"`).
///
/// Returns `false` when a global subscriber was already set; calling this more
/// than once is harmless.
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_is_idempotent() {
        let _ = init("streamlib_avsync=debug");
        assert!(!init("streamlib_avsync=debug"), "second init must not replace the subscriber");
        tracing::info!("[logging] subscriber ready");
    }
}
