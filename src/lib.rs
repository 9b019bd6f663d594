pub mod config;
pub mod pipeline; // Resumable batch processor + dataset stages

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .with_target(false)
        .try_init();

    tracing::debug!("{} v{} logging initialised", config::APP_NAME, config::APP_VERSION);
}
