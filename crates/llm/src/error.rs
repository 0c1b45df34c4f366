use thiserror::Error;

/// Errors a provider adapter can raise while driving a streaming call.
///
/// Adapters surface failures to the coordinator as a plain string message;
/// this richer enum exists so adapters can log at the right level and so the
/// coordinator can format a clean synthetic failure trailer without parsing
/// provider-specific text.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Missing or invalid API key.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Quota/credits exhausted at the provider.
    #[error("Insufficient quota: {0}")]
    InsufficientQuota(String),

    /// Requested model unknown to the provider.
    #[error("{0}")]
    ModelNotFound(String),

    /// Provider-side rate limiting.
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        /// Provider-supplied detail, if any.
        message: String,
    },

    /// Malformed request body rejected by the provider.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Transport-level failure reaching the provider.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Non-2xx response the other variants don't cover.
    #[error("Provider API error ({status}): {message}")]
    ProviderApiError {
        /// HTTP status code returned by the provider.
        status: u16,
        /// Response body, or a short description when the body is unavailable.
        message: String,
    },

    /// Stream ended or failed without a decodable provider error.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl LlmError {
    /// Map an upstream HTTP status and body into the appropriate variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => Self::AuthenticationFailed(body),
            403 => Self::InsufficientQuota(body),
            404 => Self::ModelNotFound(body),
            429 => Self::RateLimitExceeded { message: body },
            400 => Self::InvalidRequest(body),
            _ => Self::ProviderApiError { status, message: body },
        }
    }
}
