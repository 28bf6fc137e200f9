//! Console logging setup

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a console subscriber; `RUST_LOG` overrides `level` when set
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_console_logging(level: Level) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .is_ok()
}
