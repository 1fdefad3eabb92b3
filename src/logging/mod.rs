use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Environment variable holding the filter directives; `RUST_LOG` is used
/// when it is unset.
pub const LOG_ENV: &str = "BLIPQ_LOG";

/// Installs the global subscriber. Safe to call more than once: later calls
/// leave the first subscriber in place.
pub fn init_logging() {
    let filter: EnvFilter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let formatting_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .compact();

    let _ = Registry::default()
        .with(filter)
        .with(formatting_layer)
        .try_init();
}
