use crate::cli::TracingFormat;
use ctms::config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configure and initialize logging for the application.
///
/// Logs go to stderr so that command output on stdout stays machine-readable.
pub fn setup_logging(config: &Config, tracing_format: TracingFormat) {
    // Module paths use `ctms::ctms::` because the crate (`ctms`) contains
    // a `ctms` submodule for the portal client.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let base_level = &config.log_level;
        EnvFilter::new(format!(
            "warn,ctms={base_level},ctms::ctms::middleware=warn"
        ))
    });

    match tracing_format {
        TracingFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .compact(),
                )
                .init();
        }
        TracingFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .json(),
                )
                .init();
        }
    }
}
