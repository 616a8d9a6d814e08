use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Diagnostics go to stderr so stdout stays reserved for the user-facing
/// result lines. Filtering follows `RUST_LOG` when set.
pub fn init_logger() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("migratectl=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}
