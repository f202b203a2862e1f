//! Error types for dsq client operations

use dsq_core::{TestingStatus, TransportError};
use serde_json::Value;
use thiserror::Error;

/// Result type alias for dsq client operations
pub type Result<T> = std::result::Result<T, DsqClientError>;

/// Errors that can occur while setting up or using the client
#[derive(Error, Debug)]
pub enum DsqClientError {
    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A query could not be dispatched
    #[error(transparent)]
    Dispatch(#[from] dsq_core::DispatchError),

    /// The transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A datasource health check reported a non-OK status
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct HealthCheckError {
    pub message: String,
    /// Structured details from the health endpoint
    pub details: Option<Value>,
}

impl HealthCheckError {
    pub fn new(message: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            message: message.into(),
            details,
        }
    }

    /// The failure as a testing status
    pub fn to_testing_status(&self) -> TestingStatus {
        TestingStatus::error(self.message.clone(), self.details.clone())
    }
}
