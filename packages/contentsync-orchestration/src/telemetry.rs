//! Tracing subscriber setup
//!
//! `RUST_LOG` directives win; otherwise `default_level` applies to every
//! target. Logs go to stderr so CLI output on stdout stays parseable.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub fn build_env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber. Returns false if one was already set,
/// so calling it from several tests or entry points is harmless.
pub fn init_tracing(default_level: &str) -> bool {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    tracing_subscriber::registry()
        .with(build_env_filter(default_level))
        .with(fmt_layer)
        .try_init()
        .is_ok()
}
