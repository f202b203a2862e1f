//! Datasource health models

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status reported by a datasource health endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Ok,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Body of `GET /api/datasources/uid/{uid}/health`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    #[serde(default)]
    pub status: HealthStatus,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Outcome of a datasource test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestingOutcome {
    Success,
    Error,
}

/// Pass/fail result shown to the user after testing a datasource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestingStatus {
    pub status: TestingOutcome,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TestingStatus {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: TestingOutcome::Success,
            message: message.into(),
            details: None,
        }
    }

    pub fn error(message: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            status: TestingOutcome::Error,
            message: message.into(),
            details,
        }
    }
}
