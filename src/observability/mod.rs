//! Structured logging setup.
//!
//! A single `tracing_subscriber::Registry` with an `EnvFilter` built from
//! `LOG_LEVEL` and a compact formatting layer. No OTLP exporter, no metrics
//! backend, no SIEM sink — this proxy's scope is a single process logging to
//! its own stdout, not a multi-tenant gateway's observability stack.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber from `log_level` (a directive
/// string such as `"info"` or `"kvproxy=debug,tower_http=info"`). Must be
/// called exactly once, before any other part of the process logs.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
