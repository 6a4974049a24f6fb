// Module: Telemetry
// Logging initialization for the CLI. RUST_LOG wins when set; otherwise
// the verbosity flags pick the level.

use tracing::Level;
use tracing_subscriber::EnvFilter;

pub fn init_logging(quiet: bool, verbose: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,flowrunner={level}")));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
