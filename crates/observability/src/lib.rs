//! Tracing and logging setup shared by Warden binaries.

pub mod tracing;

pub use tracing::LogFormat;

/// Initialize process-wide tracing from `RUST_LOG` and `LOG_FORMAT`.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init();
}
