//! Datasource health checks

use std::sync::Arc;

use dsq_core::{BackendTransport, HealthCheckResult, HealthStatus, TestingStatus, TransportError};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::error::HealthCheckError;

/// Runs the health endpoint of configured datasources
#[derive(Clone)]
pub struct HealthChecker {
    transport: Arc<dyn BackendTransport>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker").finish_non_exhaustive()
    }
}

impl HealthChecker {
    pub fn new(transport: Arc<dyn BackendTransport>) -> Self {
        Self { transport }
    }

    /// Fetch the raw health report of datasource `uid`
    ///
    /// A failed call does not fail: the error response body stands in for the
    /// report, and errors without one become an `ERROR` report.
    #[instrument(skip(self))]
    pub async fn call_health_check(&self, uid: &str) -> HealthCheckResult {
        match self.transport.health(uid).await {
            Ok(raw) => parse_report(raw.data),
            Err(TransportError::Http { status, data, .. }) => {
                debug!(status, "Health endpoint returned an error status");
                parse_report(data)
            }
            Err(e) => {
                debug!(error = %e, "Health endpoint unreachable");
                HealthCheckResult {
                    status: HealthStatus::Error,
                    message: e.to_string(),
                    details: None,
                }
            }
        }
    }

    /// Test datasource `uid`
    ///
    /// Succeeds only when the report's status is `OK`.
    pub async fn check(&self, uid: &str) -> Result<TestingStatus, HealthCheckError> {
        let report = self.call_health_check(uid).await;
        info!(uid = %uid, status = ?report.status, "Health check finished");
        match report.status {
            HealthStatus::Ok => Ok(TestingStatus::success(report.message)),
            _ => Err(HealthCheckError::new(report.message, report.details)),
        }
    }
}

fn parse_report(data: Option<Value>) -> HealthCheckResult {
    match data {
        Some(Value::Object(obj)) => {
            serde_json::from_value(Value::Object(obj)).unwrap_or_else(|e| HealthCheckResult {
                status: HealthStatus::Unknown,
                message: format!("Invalid health response: {}", e),
                details: None,
            })
        }
        Some(Value::String(message)) => HealthCheckResult {
            status: HealthStatus::Error,
            message,
            details: None,
        },
        _ => HealthCheckResult::default(),
    }
}
