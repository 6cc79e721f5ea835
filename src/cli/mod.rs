pub mod actions;
pub mod commands;
pub mod dispatch;
pub mod telemetry;

use self::actions::Action;
use anyhow::Result;

/// Resolve the command line into a runnable action, bringing logging up
/// first so even argument problems are reported through the subscriber.
///
/// # Errors
///
/// Returns an error if telemetry setup or argument handling fails.
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    telemetry::init(engine_level(matches.get_count("verbose")))?;

    dispatch::handler(&matches)
}

/// A replication service always announces lifecycle transitions (start,
/// stop, reconnects, promotion), so INFO is the floor. `-v` opens up the
/// engine internals, `-vv` the full per-event flow.
const fn engine_level(verbose_count: u8) -> tracing::Level {
    match verbose_count {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}
