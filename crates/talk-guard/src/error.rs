//! Error types for Talk Guard

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for Guard operations
pub type Result<T> = std::result::Result<T, GuardError>;

/// Message shown to end users when a request is rejected on policy grounds.
///
/// Detection detail stays in the audit log so rejections never describe
/// what tripped them.
pub const POLICY_REJECTION_MESSAGE: &str =
    "Your request could not be processed. Please rephrase it and try again.";

/// Guard error types
#[derive(Debug, Error)]
pub enum GuardError {
    /// Field-level validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// Content rejected by the content policy
    #[error("{}", POLICY_REJECTION_MESSAGE)]
    PolicyViolation,

    /// Identity is blocked because of prior violations or request volume
    #[error("Rate limited until {next_allowed_at} ({block_minutes} minute block)")]
    RateLimited {
        next_allowed_at: DateTime<Utc>,
        block_minutes: i64,
    },

    /// The generation endpoint rejected our credentials
    #[error("Generation endpoint rejected credentials (status {status})")]
    UpstreamAuth { status: u16 },

    /// The generation endpoint is throttling us
    #[error("Generation endpoint rate limit reached")]
    UpstreamRateLimited,

    /// The generation endpoint kept failing after all retries
    #[error("Generation failed after {attempts} attempt(s): {message}")]
    TransientUpstream { attempts: u32, message: String },

    /// Prompt exceeds the maximum total length accepted by the client
    #[error("Prompt too large: {length} characters exceeds max {max}")]
    PromptTooLarge { length: usize, max: usize },

    /// Violation persistence failure
    #[error("Violation store error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Config file parse error
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error talking to the generation endpoint
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GuardError {
    /// Text that is safe to show to the person who made the request.
    pub fn user_message(&self) -> String {
        match self {
            GuardError::Validation(msg) => msg.clone(),
            GuardError::PolicyViolation => POLICY_REJECTION_MESSAGE.to_string(),
            GuardError::RateLimited {
                next_allowed_at, ..
            } => format!(
                "Too many requests. Please try again after {}.",
                next_allowed_at.format("%Y-%m-%d %H:%M UTC")
            ),
            GuardError::PromptTooLarge { max, .. } => {
                format!("Your request is too long (maximum {} characters).", max)
            }
            GuardError::UpstreamRateLimited | GuardError::TransientUpstream { .. } => {
                "The writing service is busy. Please try again shortly.".to_string()
            }
            _ => "Something went wrong. Please try again later.".to_string(),
        }
    }

    /// Whether the failure is worth retrying at the generation endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GuardError::TransientUpstream { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_violation_is_generic() {
        let err = GuardError::PolicyViolation;
        assert_eq!(err.to_string(), POLICY_REJECTION_MESSAGE);
        assert_eq!(err.user_message(), POLICY_REJECTION_MESSAGE);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GuardError::TransientUpstream {
            attempts: 3,
            message: "500".to_string()
        }
        .is_retryable());
        assert!(!GuardError::UpstreamAuth { status: 401 }.is_retryable());
        assert!(!GuardError::UpstreamRateLimited.is_retryable());
    }

    #[test]
    fn test_internal_detail_not_echoed() {
        let err = GuardError::Storage("connection refused to 10.0.0.3".to_string());
        assert!(!err.user_message().contains("10.0.0.3"));
    }
}
