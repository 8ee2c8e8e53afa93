//! Subscriber setup for the daemon and the test suites.

use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Installs the global subscriber. `RUST_LOG` wins over `default_directive`
/// (typically `log.level` from the config); a directive that fails to parse
/// falls back to `info`. Calling this twice keeps the first subscriber.
pub fn init_logging(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_names(true)
        .with_target(true)
        .compact();

    let installed = tracing::subscriber::set_global_default(Registry::default().with(filter).with(layer));
    if installed.is_err() {
        tracing::debug!(target: "relaymq::logging", "Subscriber already installed; keeping it");
    }
}
