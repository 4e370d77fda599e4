//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install a stderr subscriber filtered at `level`; `RUST_LOG` overrides it.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(level: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
