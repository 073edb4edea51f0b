//! Logging Setup
//!
//! Thin wrapper around tracing-subscriber for binary callers; the library
//! itself only emits through `tracing` macros.

use tracing_subscriber::fmt::format::FmtSpan;

/// Initialize the global tracing subscriber. Call once from the composition
/// root; long-running operations narrate progress at INFO level.
pub fn init(debug: bool) {
    let log_level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();
}
