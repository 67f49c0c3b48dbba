use thiserror::Error;

/// Application-wide error types for Sift.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Classification API call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// Credentials were rejected by an upstream service.
    #[error("Authentication failed (HTTP {status_code}): {message}")]
    AuthError { message: String, status_code: u16 },

    /// Response did not match the expected verdict schema.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Mail source failed.
    #[error("Mail error: {0}")]
    MailError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The article is missing or not in the state the operation requires.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::LlmError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if the error means the credential itself is bad.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, AppError::AuthError { .. })
    }
}

/// Outcome of a failed `classify` call, as seen by the pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    /// Retries were exhausted on a transient condition. The article is
    /// eligible for a later pipeline-level retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The service answered, but not with a valid verdict. Terminal for the article.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The credential was rejected. Fatal for the classification stage.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ClassificationError {
    /// Whether the article may go back to `pending` for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClassificationError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ClassificationError::Auth(_))
    }
}

impl From<AppError> for ClassificationError {
    fn from(err: AppError) -> Self {
        if err.is_auth_failure() {
            ClassificationError::Auth(err.to_string())
        } else if err.is_retryable() {
            ClassificationError::Transient(err.to_string())
        } else {
            // Schema violations and other 4xx answers are terminal for the article.
            ClassificationError::MalformedResponse(err.to_string())
        }
    }
}
