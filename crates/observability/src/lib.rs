//! Tracing, logging and operation reporting (shared setup).

/// Initialize process-wide observability (tracing/logging) with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Operation reporting hooks injected into the marketplace service.
pub mod reporter;

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use reporter::{NoopReporter, OperationReporter, TracingReporter};
pub use tracing::LogFormat;
