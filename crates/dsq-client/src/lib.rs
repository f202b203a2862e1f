//! dsq Client Library
//!
//! Dispatches datasource queries over HTTP and turns the responses into
//! streams of normalized results, upgrading frames that announce a live
//! channel into subscriptions.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dsq_client::{DataSourceClient, HttpBackend};
//! use dsq_core::{BackendTransport, DataSourceRegistry, Query, QueryRequest};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(HttpBackend::new("http://localhost:3000")?);
//!
//!     // Resolve datasources from the server's own list
//!     let registry = Arc::new(DataSourceRegistry::from_instances(
//!         backend.list_datasources().await?,
//!     ));
//!     let prometheus = registry.get("prom-1").expect("configured");
//!
//!     let client = DataSourceClient::new(prometheus, registry, backend);
//!     let mut results = client.query(QueryRequest::new(vec![Query::new("A")]))?;
//!     while let Some(result) = results.next().await {
//!         println!("{} frames, state {}", result.data.len(), result.state());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Testing
//!
//! The `testing` module provides a mock HTTP API and in-memory collaborators:
//!
//! ```rust,ignore
//! use dsq_client::testing::{MockApi, TestServer};
//!
//! let api = MockApi::new().with_query_response(StatusCode::OK, body);
//! let server = TestServer::start(api.router()).await?;
//! let raw = server.backend.query(call).await?;
//! ```

mod datasource;
mod dispatcher;
mod error;
mod health;
mod http;
pub mod live;
mod merger;
pub mod testing;

pub use datasource::{DataSourceClient, TEST_QUERY_SUCCESS};
pub use dispatcher::QueryDispatcher;
pub use error::{DsqClientError, HealthCheckError, Result};
pub use health::HealthChecker;
pub use http::HttpBackend;
pub use live::LocalLiveHub;
pub use merger::{one_shot, StreamMerger};

// Re-export core types for convenience
pub use dsq_core::{
    DataFrame, DataQueryError, LoadingState, Query, QueryRequest, QueryResult, ResultStream,
    TestingStatus,
};
