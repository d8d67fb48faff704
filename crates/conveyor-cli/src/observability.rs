//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

use conveyor_core::config::LoggingConfig;

/// `RUST_LOG` wins over the configured filter. Repeated calls are no-ops.
pub fn init(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if logging.json {
        builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init()
    } else {
        builder.try_init()
    };
}
