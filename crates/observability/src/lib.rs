//! Tracing/logging setup shared by every process that hosts a ledger.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{LogFormat, ParseLogFormatError, TracingConfig};

/// Initialize process-wide logging with defaults (`RUST_LOG`, JSON output).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&TracingConfig::default());
}

/// Initialize process-wide logging from an explicit configuration.
pub fn init_with(config: &TracingConfig) {
    tracing::init(config);
}
