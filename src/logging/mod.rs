//! Process-wide `tracing` subscriber setup.

use std::io;

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise this crate logs at `info`, or at
/// `debug` when `debug` is true, and everything else at `warn`.
///
/// Calling it twice is a no-op, which keeps tests that share a process happy.
pub fn configure_global_tracing(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let directives = format!("warn,reproxy_cache={level}");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let console_layer = fmt::layer()
        .compact()
        .with_target(debug)
        .with_line_number(debug)
        .with_writer(io::stderr);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init();
}
