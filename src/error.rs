//! Error types for hubctl

use std::io;
use thiserror::Error;

/// Coarse classification used by callers to decide between aborting,
/// retrying later, or carrying on in a degraded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Host misconfiguration, abort the deploy
    Fatal,
    /// Lock held by another operation, retry later
    Busy,
    /// Unknown profile or resource
    NotFound,
    /// Operation completed in a suboptimal state
    Degraded,
    /// Expected to clear up on the next poll cycle
    Transient,
    /// Everything else
    Other,
}

#[derive(Debug, Error)]
pub enum HubError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", exit_code_suffix(.code))]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another activate/delete holds the controller lock
    #[error("Busy: {0}")]
    Busy(String),

    /// No free private /16 could be found
    #[error("No free subnet: probed {probed} candidate ranges, all in use")]
    SubnetExhausted { probed: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Certificate acquisition or inspection failed
    #[error("Certificate error: {0}")]
    Certificate(String),
}

fn exit_code_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {}", code),
        None => String::new(),
    }
}

impl HubError {
    /// Map this error onto the control-plane error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::SubnetExhausted { .. } => ErrorKind::Fatal,
            HubError::Busy(_) => ErrorKind::Busy,
            HubError::NotFound(_) => ErrorKind::NotFound,
            HubError::Certificate(_) | HubError::Timeout(_) => ErrorKind::Degraded,
            HubError::Http(_) => ErrorKind::Transient,
            _ => ErrorKind::Other,
        }
    }

    /// Build a `CommandFailed` from a finished process.
    pub fn command_failed(cmd: impl Into<String>, output: &std::process::Output) -> Self {
        HubError::CommandFailed {
            cmd: cmd.into(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(error: serde_json::Error) -> Self {
        HubError::Parse(error.to_string())
    }
}

impl From<toml::de::Error> for HubError {
    fn from(error: toml::de::Error) -> Self {
        HubError::Config(error.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(error: reqwest::Error) -> Self {
        HubError::Http(error.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;
