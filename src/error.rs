// for error definitions
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Request body or query parameters failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing or invalid credentials
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Valid credentials for a deactivated caller
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Returned when a rate limit has been exceeded
    #[error("Rate limit exceeded for caller {caller_id}")]
    RateLimited {
        caller_id: String,
        /// Seconds until the oldest window entry expires
        retry_after: u64,
    },

    /// The KV store is unreachable or not in ready state
    #[error("KV unavailable: {0}")]
    KvUnavailable(String),

    /// Errors from the durable log store
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Uniqueness violation (e.g. duplicate registration email)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Lookup target does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected or internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Durable-store errors, split by whether a retry can be expected to help
#[derive(Error, Debug)]
pub enum StorageError {
    /// Connection drops, timeouts, deadlocks
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Constraint violations, bad SQL, anything a retry cannot fix
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

// Implement conversions from redis::RedisError to ApiError
impl From<redis::RedisError> for ApiError {
    fn from(err: redis::RedisError) -> Self {
        // Every Redis failure is recoverable from the caller's point of
        // view: the gateway reconnects, components fall back.
        ApiError::KvUnavailable(err.to_string())
    }
}

// Implement conversions from sqlx::Error, classifying transience by the
// driver message against the retry harness's marker list
impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                // 23505 = unique_violation
                if db.code().as_deref() == Some("23505") {
                    return ApiError::Conflict(db.message().to_string());
                }
                ApiError::Storage(classify_storage_message(&db.message().to_lowercase(), &err))
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                ApiError::Storage(StorageError::Transient(err.to_string()))
            }
            sqlx::Error::RowNotFound => ApiError::NotFound("row not found".to_string()),
            _ => ApiError::Storage(classify_storage_message(
                &err.to_string().to_lowercase(),
                &err,
            )),
        }
    }
}

fn classify_storage_message(message: &str, err: &sqlx::Error) -> StorageError {
    if crate::retry::TRANSIENT_MARKERS
        .iter()
        .any(|m| message.contains(m))
    {
        StorageError::Transient(err.to_string())
    } else {
        StorageError::Fatal(err.to_string())
    }
}

// implement conversions from serde_json::Error to ApiError
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Internal(format!("serialization: {}", err))
    }
}

impl ApiError {
    /// HTTP status code this error surfaces as
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Validation(_) => 400,
            ApiError::Unauthenticated(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::RateLimited { .. } => 429,
            ApiError::KvUnavailable(_) => 503,
            ApiError::Storage(_) | ApiError::Config(_) | ApiError::Internal(_) => 500,
        }
    }
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, ApiError>;
