//! HTTP backend transport

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dsq_core::{
    BackendQueryRequest, BackendTransport, DataSourceInstance, RawBackendResponse,
    ResourceResponse, TransportError,
};
use futures::future::{AbortHandle, Abortable};
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{DsqClientError, Result};

/// URL-encode a datasource uid for use as a single path segment.
fn encode_path_segment(id: &str) -> String {
    id.replace('/', "%2F")
}

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default connection timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Map a reqwest failure that produced no usable response
fn network_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Network("request timed out".to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

type InFlight = Arc<Mutex<HashMap<String, (u64, AbortHandle)>>>;

/// Removes a call's in-flight registration when the call ends or is dropped
struct InFlightGuard {
    in_flight: InFlight,
    request_id: String,
    call_id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(&self.request_id)
            .is_some_and(|(call_id, _)| *call_id == self.call_id)
        {
            in_flight.remove(&self.request_id);
        }
    }
}

/// Backend transport talking to the HTTP API
///
/// Query calls are tracked by request id: a new call with the id of a call
/// still in flight aborts the older one, which then fails with
/// [`TransportError::Cancelled`].
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    in_flight: InFlight,
    next_call: Arc<AtomicU64>,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url.as_str())
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

impl HttpBackend {
    /// Create a new transport
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the server (e.g., "http://localhost:3000")
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_config(base_url, DEFAULT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Create a new transport with custom timeouts
    pub fn with_config(
        base_url: &str,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()?;

        Self::from_client(client, base_url)
    }

    /// Create a new transport that sends a bearer token with every request.
    ///
    /// The token is set as a default `Authorization: Bearer <token>` header.
    pub fn with_bearer_token(base_url: &str, token: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let header_value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| DsqClientError::Config(format!("Invalid auth token: {}", e)))?;
        headers.insert(reqwest::header::AUTHORIZATION, header_value);

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Self::from_client(client, base_url)
    }

    fn from_client(client: Client, base_url: &str) -> Result<Self> {
        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_call: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Abort the in-flight query call registered under `request_id`
    ///
    /// Returns whether a call was found.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        match self.in_flight.lock().remove(request_id) {
            Some((_, handle)) => {
                debug!(request_id = %request_id, "Cancelling request");
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of query calls currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn url(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> std::result::Result<Url, TransportError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| TransportError::Network(format!("Invalid URL: {}", e)))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn resource_path(uid: &str, path: &str) -> String {
        format!(
            "/api/datasources/uid/{}/resources/{}",
            encode_path_segment(uid),
            path.trim_start_matches('/')
        )
    }

    /// Send a request and read a JSON response
    ///
    /// Non-success statuses become [`TransportError::Http`] carrying the body.
    async fn send_json(
        &self,
        request: RequestBuilder,
    ) -> std::result::Result<RawBackendResponse, TransportError> {
        let response = request.send().await.map_err(network_error)?;
        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or_default().to_string();
        let body = response.bytes().await.map_err(network_error)?;

        let data = if body.is_empty() {
            None
        } else {
            match serde_json::from_slice::<Value>(&body) {
                Ok(v) => Some(v),
                Err(e) if status.is_success() => {
                    return Err(TransportError::InvalidResponse(e.to_string()));
                }
                Err(_) => Some(Value::String(String::from_utf8_lossy(&body).into_owned())),
            }
        };

        if status.is_success() {
            Ok(RawBackendResponse {
                status: Some(status.as_u16()),
                status_text: Some(status_text),
                data,
            })
        } else {
            debug!(status = status.as_u16(), "Request failed");
            Err(TransportError::Http {
                status: status.as_u16(),
                status_text,
                data,
            })
        }
    }

    async fn read_resource(
        response: Response,
    ) -> std::result::Result<ResourceResponse, TransportError> {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(network_error)?;
        Ok(ResourceResponse {
            status,
            content_type,
            body,
        })
    }
}

#[async_trait]
impl BackendTransport for HttpBackend {
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    async fn query(
        &self,
        request: BackendQueryRequest,
    ) -> std::result::Result<RawBackendResponse, TransportError> {
        let url = self.url("/api/ds/query", &request.query_params())?;
        debug!("Posting {} queries to {}", request.body.queries.len(), url);

        let mut builder = self.client.post(url).json(&request.body);
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }

        let (handle, registration) = AbortHandle::new_pair();
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self
            .in_flight
            .lock()
            .insert(request.request_id.clone(), (call_id, handle))
        {
            debug!("Superseding in-flight request with the same id");
            previous.abort();
        }
        let _guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            request_id: request.request_id.clone(),
            call_id,
        };

        match Abortable::new(self.send_json(builder), registration).await {
            Ok(outcome) => outcome,
            Err(_aborted) => Err(TransportError::Cancelled),
        }
    }

    #[instrument(skip(self))]
    async fn health(&self, uid: &str) -> std::result::Result<RawBackendResponse, TransportError> {
        let url = self.url(
            &format!("/api/datasources/uid/{}/health", encode_path_segment(uid)),
            &[],
        )?;
        self.send_json(self.client.get(url)).await
    }

    #[instrument(skip(self))]
    async fn get_resource(
        &self,
        uid: &str,
        path: &str,
    ) -> std::result::Result<ResourceResponse, TransportError> {
        let url = self.url(&Self::resource_path(uid, path), &[])?;
        let response = self.client.get(url).send().await.map_err(network_error)?;
        Self::read_resource(response).await
    }

    #[instrument(skip(self, body))]
    async fn post_resource(
        &self,
        uid: &str,
        path: &str,
        body: Value,
    ) -> std::result::Result<ResourceResponse, TransportError> {
        let url = self.url(&Self::resource_path(uid, path), &[])?;
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        Self::read_resource(response).await
    }

    #[instrument(skip(self))]
    async fn list_datasources(
        &self,
    ) -> std::result::Result<Vec<DataSourceInstance>, TransportError> {
        let url = self.url("/api/datasources", &[])?;
        let raw = self.send_json(self.client.get(url)).await?;
        serde_json::from_value(raw.data.unwrap_or(Value::Array(Vec::new())))
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}
