//! Error types for rqueue.

/// Main error type for rqueue
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transient connect/IO failure talking to redis. Retried with the
    /// configured budget; terminal once the budget is exhausted.
    #[error("redis connection error: {0}")]
    Connection(String),

    /// A redis command failed for a non-connection reason.
    #[error("redis operation failed: {0}")]
    Operation(String),

    /// A job definition or result could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored record could not be decoded. Local to one record: the
    /// owning job is finalized as failed, the worker loop continues.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Mutually exclusive options or similar caller mistakes. Raised
    /// synchronously, nothing was mutated.
    #[error("usage error: {0}")]
    Usage(String),

    /// Invalid settings or an unsatisfiable cron schedule.
    #[error("configuration error: {0}")]
    Config(String),

    /// A startup/shutdown hook failed.
    #[error("hook failed: {0}")]
    Hook(String),

    /// The awaited job finished with `success = false`; carries the stored
    /// error representation.
    #[error("job execution failed: {0}")]
    Execution(String),

    /// The awaited job was cancelled via the abort set.
    #[error("job was aborted")]
    Aborted,

    /// The awaited job was cancelled by its execution timeout.
    #[error("job timed out during execution")]
    JobTimeout,

    /// `Job::result` exhausted its wait budget before a result appeared.
    #[error("timed out waiting for job result")]
    ResultTimeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() {
            Error::Connection(err.to_string())
        } else {
            Error::Operation(err.to_string())
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Usage("use either 'defer_until' or 'defer_by' or neither, not both".into());
        assert!(err.to_string().starts_with("usage error"));

        let err = Error::Execution("boom".into());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_aborted_is_distinct_from_timeout() {
        assert_ne!(Error::Aborted.to_string(), Error::JobTimeout.to_string());
        assert_ne!(Error::JobTimeout.to_string(), Error::ResultTimeout.to_string());
    }
}
