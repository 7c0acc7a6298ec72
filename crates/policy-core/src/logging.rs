use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

/// Installs a formatting subscriber filtered by `RUST_LOG`. Safe to call more than
/// once; only the first call installs anything.
pub fn init_logging() {
    init_logging_with_default(DEFAULT_DIRECTIVE);
}

pub fn init_logging_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
