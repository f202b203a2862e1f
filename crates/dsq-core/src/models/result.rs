//! Query result models

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::frame::DataFrame;

/// Progress state of a query result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum LoadingState {
    Loading,
    Streaming,
    #[default]
    Done,
    Error,
}

impl std::fmt::Display for LoadingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadingState::Loading => "loading",
            LoadingState::Streaming => "streaming",
            LoadingState::Done => "done",
            LoadingState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Canonical error shape for query failures and health checks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQueryError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,

    /// HTTP status of the failed call, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,

    /// Response body of the failed call, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DataQueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Error reported by the backend for one sub-query
    pub fn for_ref_id(ref_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ref_id: Some(ref_id.into()),
            ..Default::default()
        }
    }

    /// `data.message`, when the error body carries one
    pub fn data_message(&self) -> Option<&str> {
        self.data_str("message")
    }

    /// `data.error`, when the error body carries one
    pub fn data_error(&self) -> Option<&str> {
        self.data_str("error")
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

impl std::fmt::Display for DataQueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.ref_id {
            Some(ref_id) => write!(f, "{} (refId {})", self.message, ref_id),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DataQueryError {}

/// Normalized outcome of a query
///
/// `state()` is `Error` exactly when `error()` is set, and a result holds at
/// most one error: the first one recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub data: Vec<DataFrame>,

    state: LoadingState,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<DataQueryError>,

    /// Identifies the stream a result belongs to (the channel id for live updates)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl QueryResult {
    /// Finished result without error
    pub fn done(data: Vec<DataFrame>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// `{ data: [], state: Done }`
    pub fn empty() -> Self {
        Self::default()
    }

    /// Result in `Error` state carrying `error` and any partial `data`
    pub fn failed(data: Vec<DataFrame>, error: DataQueryError) -> Self {
        Self {
            data,
            state: LoadingState::Error,
            error: Some(error),
            key: None,
        }
    }

    pub fn state(&self) -> LoadingState {
        self.state
    }

    pub fn error(&self) -> Option<&DataQueryError> {
        self.error.as_ref()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Record `error` unless one is already present. Returns whether it was kept.
    pub fn record_error(&mut self, error: DataQueryError) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(error);
        self.state = LoadingState::Error;
        true
    }

    /// Change the progress state.
    ///
    /// A result holding an error stays in `Error`; `Error` is only entered
    /// through [`record_error`](Self::record_error).
    pub fn set_state(&mut self, state: LoadingState) {
        if self.error.is_none() && state != LoadingState::Error {
            self.state = state;
        }
    }

    pub fn with_state(mut self, state: LoadingState) -> Self {
        self.set_state(state);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Same state, error and key with different frames
    pub fn with_data(&self, data: Vec<DataFrame>) -> Self {
        Self {
            data,
            state: self.state,
            error: self.error.clone(),
            key: self.key.clone(),
        }
    }

    /// Frames whose `meta.channel` is set
    pub fn has_channel_frames(&self) -> bool {
        self.data.iter().any(|f| f.channel().is_some())
    }
}
