//! Error types for analysis requests

use std::fmt;

/// Errors that can occur while submitting a frame for analysis
#[derive(Debug)]
pub enum AnalysisError {
    /// Request could not be sent or the connection dropped
    Transport(String),

    /// Endpoint answered with a non-success status code
    Status(u16),

    /// Response body was not a valid analysis result
    Decode(String),

    /// No response within the configured timeout
    Timeout,

    /// Response decoded but could not be turned into a reading
    Rejected(String),
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::Transport(msg) => write!(f, "analysis request failed: {}", msg),
            AnalysisError::Status(code) => write!(f, "analysis endpoint returned HTTP {}", code),
            AnalysisError::Decode(msg) => write!(f, "invalid analysis response: {}", msg),
            AnalysisError::Timeout => write!(f, "analysis request timed out"),
            AnalysisError::Rejected(msg) => write!(f, "analysis result rejected: {}", msg),
        }
    }
}

impl std::error::Error for AnalysisError {}

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnalysisError::Timeout
        } else if err.is_decode() {
            AnalysisError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            AnalysisError::Status(status.as_u16())
        } else {
            AnalysisError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AnalysisError {
    fn from(err: serde_json::Error) -> Self {
        AnalysisError::Decode(err.to_string())
    }
}

impl From<crate::reading::ReadingError> for AnalysisError {
    fn from(err: crate::reading::ReadingError) -> Self {
        AnalysisError::Rejected(err.to_string())
    }
}
