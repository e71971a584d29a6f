//! Controller error type with operator-facing suggestions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::strategy::StrategyError;

/// Error codes for protocol responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    EngineNotRunning,
    EngineAlreadyRunning,
    InvalidInput,
    ConfigurationError,
    CommandFailed,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::EngineNotRunning => write!(f, "ENGINE_NOT_RUNNING"),
            ErrorCode::EngineAlreadyRunning => write!(f, "ENGINE_ALREADY_RUNNING"),
            ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
            ErrorCode::ConfigurationError => write!(f, "CONFIGURATION_ERROR"),
            ErrorCode::CommandFailed => write!(f, "COMMAND_FAILED"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// An error response with a hint for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn engine_not_running() -> Self {
        Self {
            code: ErrorCode::EngineNotRunning,
            message: "The casting engine is not running".to_string(),
            suggestion: Some("Run 'spellcast start' (or 'spellcast start --debug') first".into()),
        }
    }

    pub fn engine_already_running() -> Self {
        Self {
            code: ErrorCode::EngineAlreadyRunning,
            message: "The casting engine is already running".to_string(),
            suggestion: Some("Run 'spellcast stop' before starting it again".into()),
        }
    }

    /// A `step` command sent while the engine runs without debug gating.
    pub fn not_in_debug_mode() -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: "The engine is not running in debug mode".to_string(),
            suggestion: Some(
                "Restart it with 'spellcast stop' then 'spellcast start --debug'".into(),
            ),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some("Check the command syntax and try again".into()),
        }
    }

    pub fn invalid_input_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    /// Settings or strategy document could not be used.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ConfigurationError,
            message: message.into(),
            suggestion: Some(
                "Check 'current_strategy' in the settings file and that the document parses"
                    .into(),
            ),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::CommandFailed,
            message: message.into(),
            suggestion: Some("Check the daemon log for details".into()),
        }
    }

    pub fn command_failed_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            code: ErrorCode::CommandFailed,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: message.into(),
            suggestion: Some("This is an internal error. Please report it if it persists.".into()),
        }
    }
}

impl From<StrategyError> for ApiError {
    fn from(err: StrategyError) -> Self {
        match &err {
            StrategyError::NotConfigured => Self {
                code: ErrorCode::ConfigurationError,
                message: err.to_string(),
                suggestion: Some(
                    "Pass a path with 'spellcast reload <path>' or set 'current_strategy'".into(),
                ),
            },
            StrategyError::NotFound { .. } => Self {
                code: ErrorCode::ConfigurationError,
                message: err.to_string(),
                suggestion: Some(
                    "Check the path; relative paths in the settings file resolve from its directory"
                        .into(),
                ),
            },
            _ => Self::configuration(err.to_string()),
        }
    }
}
