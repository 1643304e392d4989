//! Unified logging initialisation
//!
//! All crates log through `tracing`. By default events go to a
//! `tracing-subscriber` fmt layer filtered by `RUST_LOG`; with the `ftlog`
//! feature they are forwarded as `log` records to ftlog's asynchronous
//! writer instead.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the global logger. Safe to call any number of times.
pub fn init_logging() {
    INIT.call_once(|| {
        #[cfg(feature = "ftlog")]
        init_ftlog();

        #[cfg(not(feature = "ftlog"))]
        init_tracing();
    });
}

#[cfg(feature = "ftlog")]
fn init_ftlog() {
    match ftlog::builder()
        .max_log_level(ftlog::LevelFilter::Debug)
        .bounded(100_000, false)
        .utc()
        .try_init()
    {
        // The guard flushes and stops the writer thread when dropped.
        Ok(guard) => std::mem::forget(guard),
        Err(e) => eprintln!("ftlog initialisation failed: {e}"),
    }

    tracing::info!("📝 Initialized ftlog logging");
}

#[cfg(not(feature = "ftlog"))]
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    // Another subscriber may already be installed (tests, embedding apps).
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::info!("📝 Initialized tracing logging");
    }
}

#[macro_export]
macro_rules! log_latency {
    ($operation:expr, $duration_micros:expr) => {
        if $duration_micros < 1000 {
            tracing::debug!("⚡ {} completed in {}μs", $operation, $duration_micros);
        } else {
            tracing::info!("⚡ {} completed in {:.3}ms", $operation, $duration_micros as f64 / 1000.0);
        }
    };
}

/// Log an order lifecycle step keyed by its correlation id
#[macro_export]
macro_rules! log_order {
    ($action:expr, $cid:expr, $symbol:expr) => {
        tracing::info!("📋 ORDER {}: cid={} ({})", $action, $cid, $symbol);
    };
}

#[macro_export]
macro_rules! log_error {
    ($operation:expr, $error:expr) => {
        tracing::error!("❌ {} failed: {}", $operation, $error);
    };
}
