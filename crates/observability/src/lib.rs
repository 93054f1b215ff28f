//! Process-wide tracing setup shared by binaries and integration tests.

/// Initialize process-wide observability (structured JSON logs).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
