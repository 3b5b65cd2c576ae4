use crate::config::GeneralSettings;
use tracing::Level;

/// Map a configured level name to a tracing level. `debug` forces DEBUG.
pub fn level_for(settings: &GeneralSettings) -> Level {
    if settings.debug {
        return Level::DEBUG;
    }
    match settings.log_level.to_ascii_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global fmt subscriber. Safe to call more than once; later
/// calls leave the first subscriber in place.
pub fn init(settings: &GeneralSettings) {
    let level = level_for(settings);
    if tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .is_ok()
    {
        tracing::debug!("Logger configured at level {}", level);
    }
}
