// library entry
pub mod analytics;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod ingest;
pub mod kv;
pub mod limiter;
pub mod logging;
pub mod retry;
pub mod storage;

#[cfg(test)]
pub mod test_utils;

// Re-export key components for convenience
pub use error::{ApiError, Result};
pub use logging::init as init_logging;
