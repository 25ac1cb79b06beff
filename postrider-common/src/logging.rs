//! Tracing subscriber setup for the postrider binaries.

use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initialise the global subscriber.
///
/// `POSTRIDER_VERBOSE` selects the default level (`warn`, `info`, `debug`,
/// `trace`); `RUST_LOG` syntax is honoured on top of it for per-target
/// filtering.
pub fn init() {
    let level = match std::env::var("POSTRIDER_VERBOSE")
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        _ => LevelFilter::INFO,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
