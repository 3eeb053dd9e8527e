use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over `LOG_LEVEL`; `default_level` (usually the configured
/// log level) applies when neither is set or parseable.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // try_init: tests and embedders may already have installed a subscriber
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
