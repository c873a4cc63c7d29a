#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("{provider} API request failed (status {status})")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: &'static str },

    #[error("SSE parse error: {0}")]
    SseParse(String),

    #[error("embedding count mismatch: expected {expected}, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("embedding not supported by {provider}")]
    EmbedUnsupported { provider: &'static str },

    #[error("provider closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited => true,
            Self::Api { status, .. } => *status >= 500 || *status == 408,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_transient() {
        assert!(LlmError::RateLimited.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        let err = LlmError::Api {
            provider: "openai",
            status: 503,
            body: String::new(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        let err = LlmError::Api {
            provider: "openai",
            status: 400,
            body: "bad request".into(),
        };
        assert!(!err.is_transient());
        assert!(
            !LlmError::CountMismatch {
                expected: 2,
                actual: 1
            }
            .is_transient()
        );
        assert!(!LlmError::Closed.is_transient());
    }

    #[test]
    fn count_mismatch_message() {
        let err = LlmError::CountMismatch {
            expected: 50,
            actual: 49,
        };
        assert_eq!(
            err.to_string(),
            "embedding count mismatch: expected 50, got 49"
        );
    }
}
