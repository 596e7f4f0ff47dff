use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use reproxy_cache::config::Options;
use reproxy_cache::interceptor::Interceptor;
use reproxy_cache::logging::configure_global_tracing;
use reproxy_cache::plugin::{Plugin, PluginError};
use reproxy_cache::rules::RuleSet;
use reproxy_cache::storage::MemoryStorage;

/// Exit code for configuration mistakes; the process never started serving.
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Options::parse();
    configure_global_tracing(opts.dbg);

    info!(version = env!("CARGO_PKG_VERSION"), "reproxy-cache starting");
    debug!(?opts, "options");

    let rules = match RuleSet::parse(&opts.rules) {
        Ok(rules) => rules,
        Err(e) => {
            error!(error = %e, "invalid caching rule");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if rules.is_empty() {
        warn!("no caching rules configured, every request will pass through");
    }

    let storage = Arc::new(MemoryStorage::new(opts.cleanup_interval));
    let hooks = Arc::new(Interceptor::new(rules, Arc::clone(&storage)));

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = stop_tx.send(true);
    });

    let result = Plugin::new(opts.plugin_config(), hooks).run(stop_rx).await;
    storage.shutdown().await;

    match result {
        Ok(()) => {
            info!("done");
            ExitCode::SUCCESS
        }
        Err(e @ PluginError::InvalidUpstream { .. }) => {
            error!(error = %e, "invalid configuration");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            error!(error = %e, "plugin failed");
            ExitCode::FAILURE
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
