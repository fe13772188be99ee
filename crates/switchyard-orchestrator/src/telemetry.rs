//! Tracing subscriber setup for hosts embedding the orchestrator.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a human-readable subscriber filtered by `RUST_LOG`.
///
/// Falls back to `default_directive` (e.g. `"switchyard_orchestrator=debug,info"`)
/// when `RUST_LOG` is unset. Returns `false` if a global subscriber was already
/// installed, which makes the call safe to repeat from tests.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Installs a JSON subscriber for log shippers.
///
/// Same filtering and repeat semantics as [`init_tracing`].
pub fn init_json_tracing(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok()
}

fn env_filter(default_directive: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directive.into())
}
