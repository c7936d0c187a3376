//! Logging utilities for flowtop

use tracing::Level;

/// Install the global subscriber. The stock compact formatter is enough
/// here; events already carry the interface and direction in their
/// messages, and the module path identifies the emitting task.
pub fn init_logging(log_level: Level) {
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .compact()
        .init();
}
