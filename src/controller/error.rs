//! Error types for the Elasticsearch controller

use std::time::Duration;

use thiserror::Error;

#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Password hashing error: {0}")]
    HashError(#[from] bcrypt::BcryptError),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// An object with the expected name exists but belongs to someone else
    #[error("Conflict: {0}")]
    ConflictError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Timed out: {0}")]
    TimeoutError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    #[error("Permanent error (will not retry): {0}")]
    PermanentError(String),
}

impl Error {
    /// Whether another reconcile can succeed without the user changing anything
    ///
    /// API client errors are final except for 409 and 429. A missing object may
    /// still be created by someone else, so it is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                !(400..500).contains(&resp.code) || matches!(resp.code, 409 | 429)
            }
            Error::KubeError(_)
            | Error::TransientError(_)
            | Error::TimeoutError(_)
            | Error::Cancelled
            | Error::NotFound(_)
            | Error::AlreadyExists(_) => true,
            Error::PermanentError(_)
            | Error::InvalidConfig(_)
            | Error::ValidationError(_)
            | Error::ConflictError(_)
            | Error::CertificateError(_)
            | Error::SerializationError(_)
            | Error::HashError(_)
            | Error::MissingObjectKey(_) => false,
        }
    }

    /// Check if this error means the object is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            _ => false,
        }
    }

    /// Short machine-readable reason used for status and events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::ValidationError(_) | Error::InvalidConfig(_) => "Invalid",
            Error::ConflictError(_) => "Conflict",
            Error::TimeoutError(_) => "Timeout",
            _ => "Failed",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Requeue delays for failed reconciliations
///
/// Delay for attempt `n` is `initial_delay * multiplier^n` with a symmetric
/// random `jitter` fraction applied, capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let spread = base * self.jitter;
        let offset = if spread > 0.0 {
            rand::random_range(-spread..=spread)
        } else {
            0.0
        };
        let secs = (base + offset).clamp(0.0, self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Non-retryable errors wait the full `max_delay` for the user to fix the spec
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}
