//! Error types for the node agent

use thiserror::Error;

/// Result type for control-plane calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type for container engine calls
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors returned by the control-plane client
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

/// Errors returned by the container engine client
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{operation} failed: {output}")]
    Failed { operation: String, output: String },

    #[error("Container engine unavailable: {0}")]
    Connection(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Raw engine output carried by the error, for logs
    pub fn output(&self) -> String {
        match self {
            Self::NotFound(msg) | Self::Connection(msg) => msg.clone(),
            Self::Failed { output, .. } => output.clone(),
        }
    }
}

/// Errors that unwind the worker loop or abort a CLI command
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Control-plane error: {0}")]
    Api(#[from] ApiError),

    #[error("Container engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Interrupted by signal")]
    Interrupted,
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for AgentError {
    fn from(err: toml::de::Error) -> Self {
        AgentError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_api_error_display() {
        let test_cases = vec![
            (
                ApiError::NotFound("instance i-1".to_string()),
                "Not found: instance i-1",
            ),
            (
                ApiError::Status {
                    status: 500,
                    body: "boom".to_string(),
                },
                "Unexpected status 500: boom",
            ),
            (
                ApiError::Transport("connection refused".to_string()),
                "Transport error: connection refused",
            ),
        ];

        for (error, expected_message) in test_cases {
            assert_eq!(
                error.to_string(),
                expected_message,
                "Display mismatch for {:?}",
                error
            );
        }
    }

    #[test]
    fn test_engine_error_output() {
        let err = EngineError::Failed {
            operation: "pull".to_string(),
            output: "manifest unknown".to_string(),
        };
        assert_eq!(err.to_string(), "pull failed: manifest unknown");
        assert_eq!(err.output(), "manifest unknown");
        assert!(!err.is_not_found());
        assert!(EngineError::NotFound("c".to_string()).is_not_found());
    }

    #[test]
    fn test_agent_error_from_api() {
        let err: AgentError = ApiError::NotFound("job".to_string()).into();
        match err {
            AgentError::Api(inner) => assert!(inner.is_not_found()),
            other => panic!("Expected Api variant, got: {:?}", other),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::PermissionDenied, "denied");
        let agent_err: AgentError = io_err.into();

        match agent_err {
            AgentError::Config(msg) => assert!(msg.contains("denied")),
            other => panic!("Expected Config variant, got: {:?}", other),
        }
    }
}
