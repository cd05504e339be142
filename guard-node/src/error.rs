use thiserror::Error;

/// Errors produced by the guard node core
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration error, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Neither the peer address nor the forwarded chain yields a usable IP
    #[error("unable to determine client IP")]
    ClientUnidentifiable,

    /// Request body exceeded the configured maximum
    #[error("request body exceeds {limit_bytes} bytes")]
    RequestOversize { limit_bytes: usize },

    /// Model evaluation failure, swallowed on the request path
    #[error("prediction error: {0}")]
    Prediction(String),

    /// Transient upstream transport failure, retried
    #[error("upstream transport error: {0}")]
    UpstreamTransient(String),

    /// Non-retryable upstream failure
    #[error("upstream error: {0}")]
    UpstreamPermanent(String),

    /// Missing or invalid admin API key
    #[error("invalid or missing admin API key")]
    AdminUnauthorized,

    /// Invalid input to an admin operation
    #[error("invalid admin input: {0}")]
    AdminBadInput(String),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using GuardError
pub type Result<T> = std::result::Result<T, GuardError>;

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        GuardError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GuardError::Config("sliding_window_seconds must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: sliding_window_seconds must be positive"
        );
    }

    #[test]
    fn test_oversize_display_names_limit() {
        let err = GuardError::RequestOversize { limit_bytes: 1024 };
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GuardError = io_err.into();
        assert!(matches!(err, GuardError::Io(_)));
    }
}
