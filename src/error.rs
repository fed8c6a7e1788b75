use std::time::Duration;

use thiserror::Error;

use crate::resilience::FailureClass;

/// Main error type for the bot
#[derive(Error, Debug)]
pub enum BotError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {resource}")]
    HttpStatus {
        resource: String,
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("Chat platform error (status {status:?}): {message}")]
    Platform {
        status: Option<u16>,
        retry_after: Option<Duration>,
        message: String,
    },

    // Resilience errors
    #[error("Circuit open for {resource}, retry in {retry_in:?}")]
    CircuitOpen { resource: String, retry_in: Duration },

    #[error("{resource} timed out after {elapsed:?}")]
    Timeout { resource: String, elapsed: Duration },

    #[error("{resource} failed after {attempts} attempt(s) ({kind}): {source}")]
    RetriesExhausted {
        resource: String,
        attempts: u32,
        kind: FailureClass,
        #[source]
        source: Box<BotError>,
    },

    // Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for BotError
pub type Result<T> = std::result::Result<T, BotError>;

/// Text of a caught panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl BotError {
    /// Short category used in crash records and alerts, never the message text.
    pub fn kind_label(&self) -> &'static str {
        match self {
            BotError::Config(_) | BotError::InvalidConfig(_) => "config",
            BotError::Http(_) | BotError::HttpStatus { .. } => "http",
            BotError::Platform { .. } => "platform",
            BotError::CircuitOpen { .. } => "circuit_open",
            BotError::Timeout { .. } => "timeout",
            BotError::RetriesExhausted { .. } => "retries_exhausted",
            BotError::Auth(_) => "auth",
            BotError::Json(_) => "json",
            BotError::Io(_) => "io",
            BotError::Internal(_) => "internal",
            BotError::Cancelled => "cancelled",
            BotError::Other(_) => "other",
        }
    }

    /// Errors that restarting the application cannot fix.
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            BotError::Auth(_) | BotError::Config(_) | BotError::InvalidConfig(_)
        )
    }

    /// One-line hint suitable for showing to a chat user instead of the raw error.
    pub fn user_hint(&self) -> String {
        match self {
            BotError::CircuitOpen { retry_in, .. } => format!(
                "Upstream is unavailable right now, try again in {}s.",
                retry_in.as_secs().max(1)
            ),
            BotError::Timeout { .. } => "The request took too long, try again later.".to_string(),
            BotError::RetriesExhausted { .. } => {
                "Upstream kept failing, try again later.".to_string()
            }
            BotError::Auth(_) => "The bot is not authorised for this action.".to_string(),
            BotError::Platform {
                status: Some(403), ..
            } => "The bot lacks permission for this channel.".to_string(),
            _ => "Something went wrong, the error has been logged.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_retryable_kinds() {
        assert!(BotError::Auth("bad token".into()).is_non_retryable());
        assert!(BotError::InvalidConfig("missing".into()).is_non_retryable());
        assert!(!BotError::Internal("boom".into()).is_non_retryable());
        assert!(!BotError::Cancelled.is_non_retryable());
    }

    #[test]
    fn test_circuit_open_hint_is_recognisable() {
        let err = BotError::CircuitOpen {
            resource: "oil-api".into(),
            retry_in: Duration::from_secs(42),
        };
        assert_eq!(err.kind_label(), "circuit_open");
        assert!(err.user_hint().contains("42s"));
    }

    #[test]
    fn test_exhausted_keeps_source() {
        let err = BotError::RetriesExhausted {
            resource: "oil-api".into(),
            attempts: 3,
            kind: FailureClass::Retryable,
            source: Box::new(BotError::Internal("503".into())),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Internal error: 503"));
        assert!(err.to_string().contains("3 attempt(s)"));
    }
}
