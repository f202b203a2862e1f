//! Datasource client facade

use std::sync::Arc;

use dsq_core::{
    classify_for_health_test, normalize, BackendTransport, DataSourceHooks, DataSourceInstance,
    DataSourceResolver, LiveService, QueryRequest, QueryResult, ResourceResponse, ResultStream,
    StreamOptionsProvider, TestingStatus,
};
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

use crate::dispatcher::QueryDispatcher;
use crate::error::{HealthCheckError, Result};
use crate::health::HealthChecker;

/// Message reported when a test query succeeds
pub const TEST_QUERY_SUCCESS: &str = "Data source is working";

/// One datasource bound to its query, health and resource endpoints
#[derive(Clone)]
pub struct DataSourceClient {
    dispatcher: QueryDispatcher,
    health: HealthChecker,
    transport: Arc<dyn BackendTransport>,
}

impl std::fmt::Debug for DataSourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceClient")
            .field("dispatcher", &self.dispatcher)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl DataSourceClient {
    pub fn new(
        instance: DataSourceInstance,
        resolver: Arc<dyn DataSourceResolver>,
        transport: Arc<dyn BackendTransport>,
    ) -> Self {
        Self {
            dispatcher: QueryDispatcher::new(instance, resolver, transport.clone()),
            health: HealthChecker::new(transport.clone()),
            transport,
        }
    }

    pub fn with_hooks(mut self, hooks: DataSourceHooks) -> Self {
        self.dispatcher = self.dispatcher.with_hooks(hooks);
        self
    }

    pub fn with_live_service(mut self, live: Arc<dyn LiveService>) -> Self {
        self.dispatcher = self.dispatcher.with_live_service(live);
        self
    }

    pub fn with_stream_options(mut self, provider: StreamOptionsProvider) -> Self {
        self.dispatcher = self.dispatcher.with_stream_options(provider);
        self
    }

    pub fn instance(&self) -> &DataSourceInstance {
        self.dispatcher.instance()
    }

    pub fn dispatcher(&self) -> &QueryDispatcher {
        &self.dispatcher
    }

    /// Run `request` as a stream of results
    pub fn query(&self, request: QueryRequest) -> Result<ResultStream> {
        Ok(self.dispatcher.dispatch(request)?)
    }

    /// Run `request` and return its first result
    ///
    /// `None` when the call was cancelled before producing one.
    pub async fn query_once(&self, request: QueryRequest) -> Result<Option<QueryResult>> {
        let mut stream = self.dispatcher.dispatch(request)?;
        Ok(stream.next().await)
    }

    /// Run the datasource's health check
    pub async fn test_datasource(&self) -> std::result::Result<TestingStatus, HealthCheckError> {
        self.health.check(&self.instance().uid).await
    }

    /// Test the datasource by running `request`
    ///
    /// For datasources without a health endpoint. The first query error is
    /// turned into a testing status; a clean result is a success.
    pub async fn test_with_query(&self, request: QueryRequest) -> Result<TestingStatus> {
        let Some(call) = self.dispatcher.prepare(&request)? else {
            return Ok(TestingStatus::success(TEST_QUERY_SUCCESS));
        };

        let candidate = match self.transport.query(call).await {
            Ok(raw) => {
                if !normalize(&raw, None).is_error() {
                    return Ok(TestingStatus::success(TEST_QUERY_SUCCESS));
                }
                raw.to_candidate()
            }
            Err(e) => e.to_candidate(),
        };
        debug!(uid = %self.instance().uid, "Test query failed");
        Ok(classify_for_health_test(&candidate))
    }

    /// `GET` a datasource resource
    pub async fn get_resource(&self, path: &str) -> Result<ResourceResponse> {
        Ok(self.transport.get_resource(&self.instance().uid, path).await?)
    }

    /// `POST` a datasource resource
    pub async fn post_resource(&self, path: &str, body: Value) -> Result<ResourceResponse> {
        Ok(self
            .transport
            .post_resource(&self.instance().uid, path, body)
            .await?)
    }
}
