//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber at `level`.
///
/// `RUST_LOG`, when set, takes precedence over `level`. Calling this twice
/// is harmless; the second call is ignored.
pub fn init_logging(level: &str) {
    let default_filter = format!("warn,baton_rs={level},baton={level}");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .ok();
}
