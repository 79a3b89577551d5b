//! API error types with actionable suggestions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for protocol responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionNotFound,
    SpawnFailed,
    CommandFailed,
    NotAuthenticated,
    Disconnected,
    InvalidInput,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::SessionNotFound => write!(f, "SESSION_NOT_FOUND"),
            ErrorCode::SpawnFailed => write!(f, "SPAWN_FAILED"),
            ErrorCode::CommandFailed => write!(f, "COMMAND_FAILED"),
            ErrorCode::NotAuthenticated => write!(f, "NOT_AUTHENTICATED"),
            ErrorCode::Disconnected => write!(f, "DISCONNECTED"),
            ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// An error carried across the wire or surfaced to a caller.
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
    pub fn session_not_found(session_id: &str) -> Self {
        Self {
            code: ErrorCode::SessionNotFound,
            message: format!("Session '{}' not found", session_id),
            suggestion: Some("Run 'ptykeep list' to see registered sessions".into()),
        }
    }

    /// Spawn failure. The one error class a caller sees synchronously
    /// from create-or-attach; process exit is an event, never an error.
    pub fn spawn_failed(command: &[String], error: &str) -> Self {
        let cmd_str = if command.is_empty() {
            "(default shell)".to_string()
        } else {
            command.join(" ")
        };
        Self {
            code: ErrorCode::SpawnFailed,
            message: format!("Failed to spawn '{}': {}", cmd_str, error),
            suggestion: Some(
                "Verify the command exists in PATH and the working directory is valid".into(),
            ),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::CommandFailed,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn not_authenticated() -> Self {
        Self {
            code: ErrorCode::NotAuthenticated,
            message: "Connection not authenticated".to_string(),
            suggestion: Some("Send a 'hello' frame with the daemon token before any command".into()),
        }
    }

    pub fn auth_rejected() -> Self {
        Self {
            code: ErrorCode::NotAuthenticated,
            message: "Authentication token rejected".to_string(),
            suggestion: Some(
                "The token file may be stale; reconnect after re-reading it from the socket directory"
                    .into(),
            ),
        }
    }

    /// Transport loss mid-call. Recoverable: the owner reconnects and the
    /// caller may retry.
    pub fn disconnected(detail: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Disconnected,
            message: format!("Daemon connection lost: {}", detail.into()),
            suggestion: Some("Reconnection is attempted automatically; retry the call".into()),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some("Check the request fields and try again".into()),
        }
    }

    pub fn session_limit_reached(max: usize) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: format!("Maximum session limit ({}) reached", max),
            suggestion: Some("Kill an existing session before creating a new one".into()),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_hint() {
        let err = ApiError::session_not_found("pane-1");
        let display = format!("{}", err);
        assert!(display.contains("[SESSION_NOT_FOUND]"));
        assert!(display.contains("pane-1"));
        assert!(display.contains("(hint:"));
    }

    #[test]
    fn spawn_failed_names_the_command() {
        let cmd = vec!["zsh".to_string(), "-l".to_string()];
        let err = ApiError::spawn_failed(&cmd, "no such file");
        assert!(err.message.contains("zsh -l"));
        assert!(err.message.contains("no such file"));
    }

    #[test]
    fn spawn_failed_empty_command_mentions_default_shell() {
        let err = ApiError::spawn_failed(&[], "boom");
        assert!(err.message.contains("(default shell)"));
    }

    #[test]
    fn json_round_trip() {
        let err = ApiError::disconnected("read EOF");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("DISCONNECTED"));
        let back: ApiError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
