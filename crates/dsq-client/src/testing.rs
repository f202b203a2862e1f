//! Test utilities for dsq-client
//!
//! - [`TestServer`] serves an axum router on a random local port with an
//!   [`HttpBackend`] pointed at it
//! - [`MockApi`] is a scriptable stand-in for the query, health, resource and
//!   datasource list endpoints
//! - [`MockTransport`] and [`RecordingLiveService`] replace the network
//!   collaborators entirely

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use dsq_core::{
    BackendQueryRequest, BackendTransport, DataFrame, DataSourceInstance, LiveDataStreamRequest,
    LiveService, LoadingState, QueryResult, RawBackendResponse, ResultStream, TransportError,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{HttpBackend, Result};

/// A test server that automatically shuts down when dropped
pub struct TestServer {
    pub addr: SocketAddr,
    pub backend: HttpBackend,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// Serve `router` and connect a transport to it
    ///
    /// ```ignore
    /// let api = MockApi::new().with_datasource(prometheus);
    /// let server = TestServer::start(api.router()).await?;
    /// let all = server.backend.list_datasources().await?;
    /// ```
    pub async fn start(router: Router) -> Result<Self> {
        Self::start_with_timeout(router, Duration::from_secs(5), Duration::from_secs(2)).await
    }

    /// Serve `router` with custom transport timeouts
    pub async fn start_with_timeout(
        router: Router,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        let backend =
            HttpBackend::with_config(&format!("http://{}", addr), timeout, connect_timeout)?;

        Ok(Self {
            addr,
            backend,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The transport as a shareable collaborator
    pub fn transport(&self) -> Arc<dyn BackendTransport> {
        Arc::new(self.backend.clone())
    }

    /// Shutdown the server gracefully
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}

/// A query call as seen by [`MockApi`]
#[derive(Debug, Clone, Default)]
pub struct ReceivedQuery {
    pub params: HashMap<String, String>,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub body: Value,
}

struct MockApiState {
    query_status: StatusCode,
    query_body: Value,
    query_delay: Option<Duration>,
    received: Vec<ReceivedQuery>,
    datasources: Vec<DataSourceInstance>,
    health: HashMap<String, (StatusCode, Value)>,
}

/// Scriptable HTTP API
///
/// Answers every query call with the configured status and body, records
/// what it received, and echoes resource calls back as JSON.
#[derive(Clone)]
pub struct MockApi {
    state: Arc<Mutex<MockApiState>>,
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockApiState {
                query_status: StatusCode::OK,
                query_body: json!({"results": {}}),
                query_delay: None,
                received: Vec::new(),
                datasources: Vec::new(),
                health: HashMap::new(),
            })),
        }
    }

    pub fn with_query_response(self, status: StatusCode, body: Value) -> Self {
        {
            let mut state = self.state.lock();
            state.query_status = status;
            state.query_body = body;
        }
        self
    }

    /// Hold every query call for `delay` before answering
    pub fn with_query_delay(self, delay: Duration) -> Self {
        self.state.lock().query_delay = Some(delay);
        self
    }

    pub fn with_datasource(self, instance: DataSourceInstance) -> Self {
        self.state.lock().datasources.push(instance);
        self
    }

    pub fn with_health(self, uid: &str, status: StatusCode, body: Value) -> Self {
        self.state.lock().health.insert(uid.to_string(), (status, body));
        self
    }

    /// Query calls received so far
    pub fn received(&self) -> Vec<ReceivedQuery> {
        self.state.lock().received.clone()
    }

    /// Wait until at least `count` query calls have arrived
    pub async fn wait_for_queries(&self, count: usize, timeout: Duration) -> bool {
        let api = self.clone();
        wait_for(
            move || {
                let api = api.clone();
                async move { api.state.lock().received.len() >= count }
            },
            timeout,
        )
        .await
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/ds/query", post(mock_query))
            .route("/api/datasources", get(mock_datasources))
            .route("/api/datasources/uid/{uid}/health", get(mock_health))
            .route("/api/datasources/uid/{uid}/resources/{*path}", any(mock_resource))
            .with_state(self.clone())
    }
}

async fn mock_query(
    State(api): State<MockApi>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    let (status, response, delay) = {
        let mut state = api.state.lock();
        state.received.push(ReceivedQuery {
            params,
            headers,
            body,
        });
        (state.query_status, state.query_body.clone(), state.query_delay)
    };

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    (status, Json(response))
}

async fn mock_datasources(State(api): State<MockApi>) -> Json<Vec<DataSourceInstance>> {
    Json(api.state.lock().datasources.clone())
}

async fn mock_health(
    State(api): State<MockApi>,
    Path(uid): Path<String>,
) -> (StatusCode, Json<Value>) {
    match api.state.lock().health.get(&uid) {
        Some((status, body)) => (*status, Json(body.clone())),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "Data source not found"})),
        ),
    }
}

async fn mock_resource(
    Path((uid, path)): Path<(String, String)>,
    method: Method,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (
        StatusCode::OK,
        Json(json!({
            "uid": uid,
            "path": path,
            "method": method.as_str(),
            "body": body,
        })),
    )
}

/// In-memory transport with canned query responses
///
/// Responses are returned in the order they were pushed; once they run out
/// every call gets an empty successful response.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<std::result::Result<RawBackendResponse, TransportError>>>,
    calls: Mutex<Vec<BackendQueryRequest>>,
    health: Mutex<Option<std::result::Result<RawBackendResponse, TransportError>>>,
    datasources: Mutex<Vec<DataSourceInstance>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: std::result::Result<RawBackendResponse, TransportError>) {
        self.responses.lock().push_back(response);
    }

    pub fn set_health(&self, response: std::result::Result<RawBackendResponse, TransportError>) {
        *self.health.lock() = Some(response);
    }

    pub fn set_datasources(&self, datasources: Vec<DataSourceInstance>) {
        *self.datasources.lock() = datasources;
    }

    /// Query calls received so far
    pub fn calls(&self) -> Vec<BackendQueryRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl BackendTransport for MockTransport {
    async fn query(
        &self,
        request: BackendQueryRequest,
    ) -> std::result::Result<RawBackendResponse, TransportError> {
        self.calls.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(RawBackendResponse::ok(json!({"results": {}}))))
    }

    async fn health(&self, _uid: &str) -> std::result::Result<RawBackendResponse, TransportError> {
        self.health
            .lock()
            .clone()
            .unwrap_or_else(|| Err(TransportError::NotSupported("health".to_string())))
    }

    async fn list_datasources(
        &self,
    ) -> std::result::Result<Vec<DataSourceInstance>, TransportError> {
        Ok(self.datasources.lock().clone())
    }
}

/// Decrements the open subscription count when a stream is dropped
struct OpenSubscription(Arc<AtomicUsize>);

impl Drop for OpenSubscription {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Live service that records subscriptions and forwards frames sent by tests
///
/// Frames are emitted as-is, without buffering, in `Streaming` state keyed
/// by channel id.
#[derive(Default)]
pub struct RecordingLiveService {
    requests: Mutex<Vec<LiveDataStreamRequest>>,
    senders: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<DataFrame>>>>,
    open: Arc<AtomicUsize>,
}

impl RecordingLiveService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscriptions requested so far
    pub fn requests(&self) -> Vec<LiveDataStreamRequest> {
        self.requests.lock().clone()
    }

    /// Subscriptions not yet dropped
    pub fn open_subscriptions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Deliver `frame` to every subscriber of `channel_id`
    pub fn send(&self, channel_id: &str, frame: DataFrame) {
        if let Some(senders) = self.senders.lock().get_mut(channel_id) {
            senders.retain(|tx| tx.send(frame.clone()).is_ok());
        }
    }
}

impl LiveService for RecordingLiveService {
    fn get_data_stream(&self, request: LiveDataStreamRequest) -> ResultStream {
        let key = request.address.channel_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().entry(key.clone()).or_default().push(tx);
        self.requests.lock().push(request);

        self.open.fetch_add(1, Ordering::SeqCst);
        let guard = OpenSubscription(self.open.clone());

        UnboundedReceiverStream::new(rx)
            .map(move |frame| {
                let _open = &guard;
                QueryResult::done(vec![frame])
                    .with_state(LoadingState::Streaming)
                    .with_key(key.clone())
            })
            .boxed()
    }
}
