use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Ensure initialization happens only once
static INIT: Once = Once::new();

/// Initialize the logging system with sensible defaults.
///
/// Log level can be set using the RUST_LOG environment variable.
/// Example: RUST_LOG=debug,nexmedis_api=trace
pub fn init() {
    INIT.call_once(|| {
        // Create a filter based on the RUST_LOG environment variable
        // Default to 'info' level if not specified
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true) // Include module path in logs
                    .with_thread_ids(true) // Useful for debugging concurrency issues
                    .with_line_number(true),
            )
            .init();

        tracing::info!("Logging initialized");
    });
}

/// Macro for logging rate limiting decisions
#[macro_export]
macro_rules! rate_limit_event {
    ($caller:expr, $allowed:expr, $limit:expr, $current:expr) => {
        tracing::info!(
            caller_id = $caller,
            allowed = $allowed,
            limit = $limit,
            current = $current,
            "Rate limit check"
        )
    };
}

/// Macro for logging flush outcomes with timing
#[macro_export]
macro_rules! flush_event {
    ($written:expr, $buffered:expr, $elapsed_ms:expr) => {
        tracing::debug!(
            written = $written,
            buffered = $buffered,
            elapsed_ms = $elapsed_ms,
            "Batch flush"
        )
    };
}
