//! B2 API Error Types
//!
//! Maps HTTP status codes to specific error variants for retry decisions.

/// B2 API error types
#[derive(Debug, thiserror::Error)]
pub enum B2Error {
    #[error("Authentication expired, token needs refresh")]
    AuthExpired,

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),
}

impl B2Error {
    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            B2Error::RateLimited
                | B2Error::Timeout
                | B2Error::Network(_)
                | B2Error::Server(_, _)
                | B2Error::AuthExpired
        )
    }

    /// Create a B2Error from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => B2Error::AuthExpired,
            403 => B2Error::Forbidden(body.to_string()),
            404 => B2Error::NotFound(body.to_string()),
            408 => B2Error::Timeout,
            429 => B2Error::RateLimited,
            500..=599 => B2Error::Server(status, body.to_string()),
            _ => B2Error::Request(format!("HTTP {}: {}", status, body)),
        }
    }

    /// Classify a transport-level reqwest failure
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            B2Error::Timeout
        } else if err.is_connect() || err.is_request() {
            B2Error::Network(err.to_string())
        } else {
            B2Error::Request(err.to_string())
        }
    }

    /// Find a B2Error anywhere in an anyhow chain
    pub fn find(err: &anyhow::Error) -> Option<&B2Error> {
        err.chain().find_map(|cause| cause.downcast_ref::<B2Error>())
    }

    /// Whether an anyhow error is (or wraps) a B2 404
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(B2Error::NotFound(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert!(matches!(B2Error::from_status(401, ""), B2Error::AuthExpired));
        assert!(matches!(B2Error::from_status(404, "x"), B2Error::NotFound(_)));
        assert!(matches!(B2Error::from_status(503, "x"), B2Error::Server(503, _)));
        assert!(matches!(B2Error::from_status(400, "x"), B2Error::Request(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(B2Error::RateLimited.is_retryable());
        assert!(B2Error::Server(500, String::new()).is_retryable());
        assert!(!B2Error::NotFound(String::new()).is_retryable());
        assert!(!B2Error::Forbidden(String::new()).is_retryable());
    }

    #[test]
    fn test_find_through_context() {
        use anyhow::Context;
        let err: anyhow::Result<()> =
            Err(B2Error::NotFound("gone".to_string())).context("Failed to download file");
        let err = err.unwrap_err();
        assert!(B2Error::is_not_found(&err));
    }
}
