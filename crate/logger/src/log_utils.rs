use std::sync::Once;

use tracing_subscriber::{
    EnvFilter,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Filter used when neither `RUST_LOG` nor an explicit filter is provided
pub const DEFAULT_LOG_FILTER: &str = "info,encryptkey_hsm=info,encryptkey=info";

static LOG_INIT: Once = Once::new();

/// Install the global tracing subscriber once for the whole process.
///
/// An explicit `filter` wins over `RUST_LOG`, which wins over
/// [`DEFAULT_LOG_FILTER`]. Subsequent calls are no-ops so tests may call it
/// freely.
pub fn log_init(filter: Option<&str>) {
    LOG_INIT.call_once(|| {
        let env_filter = match filter {
            Some(filter) => EnvFilter::new(filter),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        };
        if let Err(e) = tracing_setup(env_filter) {
            eprintln!("tracing subscriber not installed: {e}");
        }
    });
}

/// Fails when a global subscriber is already installed, e.g. by the host
/// application
fn tracing_setup(filter: EnvFilter) -> Result<(), TryInitError> {
    let format = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()
}
