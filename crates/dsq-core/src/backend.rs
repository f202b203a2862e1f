//! Collaborator traits for the dispatch pipeline
//!
//! The dispatcher never talks to the network itself. It is handed a
//! [`BackendTransport`] for the query, health and resource endpoints and,
//! optionally, a [`LiveService`] that turns a channel address into a stream of
//! updates.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;

use crate::datasource::DataSourceInstance;
use crate::error::TransportError;
use crate::live::{LiveChannelAddress, StreamingFrameOptions};
use crate::models::{DataFrame, Query, QueryResult, TimeRange};
use crate::normalize::RawBackendResponse;

/// A push sequence of query results
///
/// Dropping the stream cancels everything feeding it.
pub type ResultStream = BoxStream<'static, QueryResult>;

/// Header naming the single datasource a query batch targets
pub const DATASOURCE_UID_HEADER: &str = "X-Datasource-Uid";
/// Header flagging batches that contain expression queries
pub const EXPRESSION_HEADER: &str = "X-Grafana-From-Expr";

/// JSON body of `POST /api/ds/query`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryBody {
    pub queries: Vec<Query>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<TimeRange>,

    /// Range start as epoch milliseconds, in string form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Range end as epoch milliseconds, in string form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl QueryBody {
    pub fn new(queries: Vec<Query>, range: Option<TimeRange>) -> Self {
        let (from, to) = match &range {
            Some(r) => (Some(r.from_ms().to_string()), Some(r.to_ms().to_string())),
            None => (None, None),
        };
        Self {
            queries,
            range,
            from,
            to,
        }
    }
}

/// A query call handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct BackendQueryRequest {
    /// Correlation id; a newer call with the same id supersedes this one
    pub request_id: String,
    /// Plugin type of the dispatching datasource (`ds_type` query parameter)
    pub datasource_type: Option<String>,
    /// Set when exactly one concrete datasource is queried
    pub datasource_uid: Option<String>,
    /// Whether any query targets the expression pseudo-datasource
    pub has_expression: bool,
    pub body: QueryBody,
}

impl BackendQueryRequest {
    /// Query-string parameters for the call
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(ds_type) = &self.datasource_type {
            params.push(("ds_type", ds_type.clone()));
        }
        if self.has_expression {
            params.push(("expression", "true".to_string()));
        }
        params
    }

    /// Extra headers for the call
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if self.has_expression {
            headers.push((EXPRESSION_HEADER, "true".to_string()));
        }
        if let Some(uid) = &self.datasource_uid {
            headers.push((DATASOURCE_UID_HEADER, uid.clone()));
        }
        headers
    }
}

/// Unmodified answer of a datasource resource handler
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl ResourceResponse {
    /// Parse the body as JSON
    pub fn json(&self) -> Result<Value, TransportError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network side of the pipeline
///
/// Only `query` is required; transports that cannot reach the other
/// endpoints keep the default implementations.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// `POST /api/ds/query`
    async fn query(
        &self,
        request: BackendQueryRequest,
    ) -> Result<RawBackendResponse, TransportError>;

    /// `GET /api/datasources/uid/{uid}/health`
    async fn health(&self, uid: &str) -> Result<RawBackendResponse, TransportError> {
        let _ = uid;
        Err(TransportError::NotSupported("health".to_string()))
    }

    /// `GET /api/datasources/uid/{uid}/resources/{path}`
    async fn get_resource(
        &self,
        uid: &str,
        path: &str,
    ) -> Result<ResourceResponse, TransportError> {
        let _ = (uid, path);
        Err(TransportError::NotSupported("resources".to_string()))
    }

    /// `POST /api/datasources/uid/{uid}/resources/{path}`
    async fn post_resource(
        &self,
        uid: &str,
        path: &str,
        body: Value,
    ) -> Result<ResourceResponse, TransportError> {
        let _ = (uid, path, body);
        Err(TransportError::NotSupported("resources".to_string()))
    }

    /// `GET /api/datasources`
    async fn list_datasources(&self) -> Result<Vec<DataSourceInstance>, TransportError> {
        Err(TransportError::NotSupported("datasource listing".to_string()))
    }
}

/// Descriptor of one live subscription
#[derive(Debug, Clone, PartialEq)]
pub struct LiveDataStreamRequest {
    pub address: LiveChannelAddress,
    /// How updates are buffered against `frame`
    pub buffer: StreamingFrameOptions,
    /// The frame that announced the channel; seeds the buffer
    pub frame: DataFrame,
}

/// Delivers live channel updates
pub trait LiveService: Send + Sync {
    /// Open a subscription. The stream stays open until it is dropped.
    fn get_data_stream(&self, request: LiveDataStreamRequest) -> ResultStream;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn body_restates_range_as_epoch_strings() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let body = QueryBody::new(vec![Query::new("A")], Some(TimeRange::absolute(from, to)));

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["from"], json!("1704067200000"));
        assert_eq!(json["to"], json!("1704070800000"));
        assert_eq!(json["range"]["raw"]["from"], json!(from.to_rfc3339()));
        assert_eq!(json["queries"][0]["refId"], json!("A"));
    }

    #[test]
    fn body_without_range() {
        let json = serde_json::to_value(QueryBody::new(vec![], None)).unwrap();
        assert_eq!(json, json!({"queries": []}));
    }

    #[test]
    fn routing_hints() {
        let request = BackendQueryRequest {
            request_id: "Q1".into(),
            datasource_type: Some("prometheus".into()),
            datasource_uid: Some("p1".into()),
            has_expression: true,
            body: QueryBody::new(vec![], None),
        };
        assert_eq!(
            request.query_params(),
            vec![("ds_type", "prometheus".to_string()), ("expression", "true".to_string())]
        );
        assert_eq!(
            request.headers(),
            vec![
                (EXPRESSION_HEADER, "true".to_string()),
                (DATASOURCE_UID_HEADER, "p1".to_string())
            ]
        );
    }
}
