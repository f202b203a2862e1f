//! Error types for query dispatch

use serde_json::{json, Value};
use thiserror::Error;

use crate::models::DataSourceRef;
use crate::normalize::RawBackendResponse;

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors raised synchronously by the dispatcher, before any network call
///
/// Everything that happens after the backend call is turned into a
/// [`QueryResult`](crate::models::QueryResult) instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A query explicitly references a datasource that cannot be resolved
    #[error("Unknown Datasource: {0}")]
    UnknownDatasource(DataSourceRef),
}

/// Errors reported by a backend transport
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The server answered with a non-success status
    #[error("HTTP {status} {status_text}")]
    Http {
        status: u16,
        status_text: String,
        /// Response body, when it was JSON
        data: Option<Value>,
    },

    /// The request never produced a response (connect failure, timeout, ...)
    #[error("Network error: {0}")]
    Network(String),

    /// The response could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The request was superseded or cancelled by its request id
    #[error("Request cancelled")]
    Cancelled,

    /// The transport does not implement this call
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl TransportError {
    /// The failed HTTP response, for errors that have one
    pub fn as_raw_response(&self) -> Option<RawBackendResponse> {
        match self {
            TransportError::Http {
                status,
                status_text,
                data,
            } => Some(RawBackendResponse {
                status: Some(*status),
                status_text: Some(status_text.clone()),
                data: data.clone(),
            }),
            _ => None,
        }
    }

    /// JSON view of the error, as handed to the error classifier
    pub fn to_candidate(&self) -> Value {
        match self {
            TransportError::Http {
                status,
                status_text,
                data,
            } => json!({
                "status": status,
                "statusText": status_text,
                "data": data,
            }),
            other => json!({ "message": other.to_string() }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// Errors decoding one frame from its wire form
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed {encoding} entry: {message}")]
    Malformed {
        encoding: &'static str,
        message: String,
    },
}

impl DecodeError {
    pub(crate) fn malformed(encoding: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            encoding,
            message: message.into(),
        }
    }
}
