//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// Logs go to stderr at `INFO` unless `RUST_LOG` says otherwise, e.g.
/// `RUST_LOG=tdx_device_plugin=debug` to see every RPC.
pub fn init() {
    init_with_default(filter::LevelFilter::INFO);
}

fn init_with_default(default_level: filter::LevelFilter) {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false)
        .with_filter(env_filter);

    registry().with(fmt_layer).init();
}
