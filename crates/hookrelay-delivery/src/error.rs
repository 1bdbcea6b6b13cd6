//! Error types for dispatch, queue and delivery operations.
//!
//! Transport failures carry enough context to build the log's error message
//! and to decide between rescheduling and giving up. Storage failures are
//! wrapped from `CoreError` so callers deal with one error type.

use std::{borrow::Cow, fmt};

use hookrelay_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Bytes of response body quoted in an HTTP error message. The full body
/// stays available through `DeliveryError::response_body`.
pub const MESSAGE_BODY_PREVIEW_BYTES: usize = 200;

/// Errors raised while dispatching, queueing or delivering webhooks.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Destination URL or client setup is unusable.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },

    /// Payload or envelope could not be serialized.
    #[error("failed to encode payload: {message}")]
    Encoding {
        /// Serializer message
        message: String,
    },

    /// Connection could not be established or broke mid-request.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Transport message
        message: String,
    },

    /// Request did not complete within the configured timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured request timeout
        timeout_seconds: u64,
    },

    /// Destination answered 5xx.
    #[error("HTTP {status_code}: {}", body_preview(.body))]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Destination answered 429.
    #[error("HTTP 429: {}", body_preview(.body))]
    RateLimited {
        /// Truncated response body
        body: String,
    },

    /// Destination answered 4xx other than 429.
    #[error("HTTP {status_code}: {}", body_preview(.body))]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Destination answered with an informational or redirect status.
    #[error("HTTP {status_code}: {}", body_preview(.body))]
    UnexpectedStatus {
        /// HTTP status code (1xx or 3xx)
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Attempt budget spent.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts consumed
        attempts: u32,
    },

    /// Persistence layer failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Storage message
        message: String,
    },

    /// Stored envelope could not be decoded.
    #[error("Invalid job payload: {message}")]
    MalformedEnvelope {
        /// Decoder message
        message: String,
    },

    /// No job with the given ID exists.
    #[error("job not found: {job_id}")]
    JobNotFound {
        /// Requested job
        job_id: String,
    },

    /// Operation is not allowed in the job's current state.
    #[error("job {job_id} is {status}")]
    InvalidJobState {
        /// Affected job
        job_id: String,
        /// Current status
        status: String,
    },
}

impl DeliveryError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding { message: message.into() }
    }

    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a malformed envelope error.
    pub fn malformed_envelope(message: impl Into<String>) -> Self {
        Self::MalformedEnvelope { message: message.into() }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Classifies a non-2xx HTTP response.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status_code {
            429 => Self::RateLimited { body },
            400..=499 => Self::ClientError { status_code, body },
            500..=599 => Self::ServerError { status_code, body },
            _ => Self::UnexpectedStatus { status_code, body },
        }
    }

    /// HTTP status code if the destination responded.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ServerError { status_code, .. }
            | Self::ClientError { status_code, .. }
            | Self::UnexpectedStatus { status_code, .. } => Some(*status_code),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Response body if the destination responded.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            Self::ServerError { body, .. }
            | Self::ClientError { body, .. }
            | Self::UnexpectedStatus { body, .. }
            | Self::RateLimited { body } => Some(body),
            _ => None,
        }
    }

    /// Whether a delivery attempt that failed this way should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::UnexpectedStatus { .. }
            | Self::DatabaseError { .. } => true,

            Self::Configuration { .. }
            | Self::Encoding { .. }
            | Self::ClientError { .. }
            | Self::RetriesExhausted { .. }
            | Self::MalformedEnvelope { .. }
            | Self::JobNotFound { .. }
            | Self::InvalidJobState { .. } => false,
        }
    }
}

fn body_preview(body: &str) -> Cow<'_, str> {
    if body.len() <= MESSAGE_BODY_PREVIEW_BYTES {
        return Cow::Borrowed(body);
    }
    let mut end = MESSAGE_BODY_PREVIEW_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}...", &body[..end]))
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        Self::database(error.to_string())
    }
}

/// Category of delivery error for logging fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity and timeouts.
    Network,
    /// HTTP 4xx.
    Client,
    /// HTTP 5xx.
    Server,
    /// HTTP 429.
    RateLimit,
    /// Storage.
    Database,
    /// Bad URL, bad envelope or serialization.
    Configuration,
    /// Job lookup or state.
    Queue,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. }
            | DeliveryError::UnexpectedStatus { .. }
            | DeliveryError::RetriesExhausted { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::Configuration { .. }
            | DeliveryError::Encoding { .. }
            | DeliveryError::MalformedEnvelope { .. } => Self::Configuration,
            DeliveryError::JobNotFound { .. } | DeliveryError::InvalidJobState { .. } => {
                Self::Queue
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
            Self::Queue => write!(f, "queue"),
        }
    }
}
