//! Error taxonomy for upstream fetches and caller-facing queries.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure of a single upstream call, as seen by the retry layer.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// HTTP 403 with an exhausted quota. `reset` is the quota window reset
    /// time when the upstream reported one.
    #[error("rate limited by upstream")]
    RateLimited { reset: Option<DateTime<Utc>> },

    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

impl FetchError {
    /// Maps an octocrab error into our taxonomy. Rate-limit rejections are
    /// recognized by status 403/429 plus the upstream message; the reset
    /// timestamp is filled in later by the client (octocrab does not expose
    /// response headers on its error type).
    pub fn from_octocrab(err: &octocrab::Error) -> Self {
        match err {
            octocrab::Error::GitHub { source, .. } => {
                let status = source.status_code.as_u16();
                let message = source.message.clone();
                if (status == 403 || status == 429)
                    && message.to_lowercase().contains("rate limit")
                {
                    FetchError::RateLimited { reset: None }
                } else {
                    FetchError::Status { status, message }
                }
            }
            other => FetchError::Network(other.to_string()),
        }
    }

    /// Whether this failure is a 404 "not found" response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::Status { status: 404, .. })
    }
}

/// Caller-facing error for the aggregation pipeline.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("upstream rate limit exceeded, please retry later")]
    RateLimited,

    #[error("upstream request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    /// Not a real failure; the caller asked the operation to stop.
    #[error("operation cancelled")]
    Cancelled,
}

impl QueryError {
    /// Human-readable failure category for display alongside partial results.
    pub fn category(&self) -> &'static str {
        match self {
            QueryError::InvalidInput(_) => "invalid-input",
            QueryError::RateLimited => "rate-limited",
            QueryError::Timeout => "timeout",
            QueryError::Network(_) => "network",
            QueryError::Upstream(_) => "server",
            QueryError::Cancelled => "cancelled",
        }
    }
}

impl From<FetchError> for QueryError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::RateLimited { .. } => QueryError::RateLimited,
            FetchError::Timeout => QueryError::Timeout,
            FetchError::Network(msg) => QueryError::Network(msg),
            FetchError::Status { status, message } => {
                QueryError::Upstream(format!("{status}: {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_conversion() {
        let err: QueryError = FetchError::RateLimited { reset: None }.into();
        assert!(matches!(err, QueryError::RateLimited));
        assert_eq!(err.category(), "rate-limited");

        let err: QueryError = FetchError::Status {
            status: 502,
            message: "bad gateway".into(),
        }
        .into();
        assert_eq!(err.category(), "server");
    }

    #[test]
    fn test_not_found_detection() {
        let err = FetchError::Status {
            status: 404,
            message: "Not Found".into(),
        };
        assert!(err.is_not_found());
        assert!(!FetchError::Timeout.is_not_found());
    }
}
