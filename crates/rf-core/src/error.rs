use crate::converter::ConversionError;

/// Errors raised anywhere in the routing engine.
///
/// Configuration errors are fatal at route-start time and never occur at
/// message time. Everything else flows through the error-handler path as a
/// processing exception recorded on the Exchange.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteflowError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Processing error: {message}")]
    Processing { message: String, retryable: bool },

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Producer completed neither synchronously nor via callback")]
    NoCompletion,

    #[error("Dead letter delivery failed: {0}")]
    DeadLetterFailed(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

impl RouteflowError {
    /// Transient processing failure, subject to redelivery.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Processing { message: message.into(), retryable: true }
    }

    /// Permanent processing failure, never redelivered.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Processing { message: message.into(), retryable: false }
    }

    /// Whether the default redelivery policy may retry this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Processing { retryable, .. } => *retryable,
            Self::Repository(_) | Self::NoCompletion => true,
            Self::Configuration(_)
            | Self::Conversion(_)
            | Self::DeadLetterFailed(_)
            | Self::ShutdownInProgress => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RouteflowError>;
