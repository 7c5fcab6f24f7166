//! # logging
//!
//! why: one switch to turn on readable logs for nodes, tests and embedding binaries
//! relations: every crate logs through tracing macros; this installs the subscriber
//! what: init_tracing with an env filter

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`)
///
/// safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
