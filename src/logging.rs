//! Tracing subscriber initialization
//!
//! Embedding applications usually install their own subscriber; this
//! helper exists for binaries and tests that just want sane defaults.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize a global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the provided default filter.
/// Calling this more than once is harmless; later calls are no-ops.
pub fn init(default_filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
