//! Log subscriber setup for binaries and tests embedding memex.
//!
//! The library itself only emits `tracing` events; nothing is printed until
//! a host installs a subscriber, usually through [`init`].

use tracing_subscriber::EnvFilter;

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (e.g. `"memex=info"`).
///
/// Returns `false` if a global subscriber was already installed, so calling
/// this more than once is harmless.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
