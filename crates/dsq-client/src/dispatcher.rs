//! Query dispatch
//!
//! Turns a [`QueryRequest`] into one backend call and the call's outcome into
//! a [`ResultStream`]. Only datasource resolution fails synchronously; every
//! failure after that point is delivered as a result in `Error` state.

use std::collections::BTreeSet;
use std::sync::Arc;

use dsq_core::{
    classify_transport, normalize, standard_stream_options_provider, BackendQueryRequest,
    BackendTransport, DataSourceHooks, DataSourceInstance, DataSourceRef, DataSourceResolver,
    DispatchError, DispatchResult, LiveService, Query, QueryBody, QueryRequest, QueryResult,
    ResultStream, StreamOptionsProvider, TransportError,
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::merger::{one_shot, StreamMerger};

/// Dispatches query requests on behalf of one datasource
#[derive(Clone)]
pub struct QueryDispatcher {
    instance: DataSourceInstance,
    hooks: DataSourceHooks,
    resolver: Arc<dyn DataSourceResolver>,
    transport: Arc<dyn BackendTransport>,
    merger: StreamMerger,
    stream_options: StreamOptionsProvider,
}

impl std::fmt::Debug for QueryDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDispatcher")
            .field("instance", &self.instance)
            .field("hooks", &self.hooks)
            .field("merger", &self.merger)
            .finish()
    }
}

impl QueryDispatcher {
    /// Create a dispatcher for `instance`
    ///
    /// Queries without a datasource reference target `instance`; others are
    /// looked up through `resolver`.
    pub fn new(
        instance: DataSourceInstance,
        resolver: Arc<dyn DataSourceResolver>,
        transport: Arc<dyn BackendTransport>,
    ) -> Self {
        Self {
            instance,
            hooks: DataSourceHooks::default(),
            resolver,
            transport,
            merger: StreamMerger::new(),
            stream_options: standard_stream_options_provider,
        }
    }

    pub fn with_hooks(mut self, hooks: DataSourceHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Upgrade results carrying channel frames into live streams
    pub fn with_live_service(mut self, live: Arc<dyn LiveService>) -> Self {
        self.merger = StreamMerger::with_live_service(live);
        self
    }

    pub fn with_stream_options(mut self, provider: StreamOptionsProvider) -> Self {
        self.stream_options = provider;
        self
    }

    pub fn instance(&self) -> &DataSourceInstance {
        &self.instance
    }

    /// Build the backend call for `request`
    ///
    /// Returns `None` when no query is left after filtering.
    pub fn prepare(&self, request: &QueryRequest) -> DispatchResult<Option<BackendQueryRequest>> {
        let mut queries = Vec::with_capacity(request.targets.len());
        let mut uids = BTreeSet::new();
        let mut has_expression = false;

        for query in &request.targets {
            if let Some(filter) = &self.hooks.filter_query {
                if !filter(query) {
                    debug!(ref_id = %query.ref_id, "Query filtered out");
                    continue;
                }
            }

            if query.is_expression() {
                has_expression = true;
                queries.push(Query {
                    datasource: Some(DataSourceRef::expression()),
                    ..query.clone()
                });
                continue;
            }

            let instance = self.resolve(query)?;
            let mut query = query.clone();
            if instance.uid == self.instance.uid {
                if let Some(apply) = &self.hooks.apply_template_variables {
                    query = apply(query, &request.scoped_vars);
                }
            }

            query.datasource = Some(instance.to_ref());
            query.datasource_id = Some(instance.id);
            query.interval_ms = request.interval_ms;
            query.max_data_points = request.max_data_points;
            uids.insert(instance.uid);
            queries.push(query);
        }

        if queries.is_empty() {
            return Ok(None);
        }

        let datasource_uid = match uids.len() {
            1 => uids.into_iter().next(),
            _ => None,
        };

        Ok(Some(BackendQueryRequest {
            request_id: request.request_id.clone(),
            datasource_type: Some(self.instance.type_name.clone()),
            datasource_uid,
            has_expression,
            body: QueryBody::new(queries, request.range.clone()),
        }))
    }

    fn resolve(&self, query: &Query) -> DispatchResult<DataSourceInstance> {
        let Some(reference) = &query.datasource else {
            return Ok(self.instance.clone());
        };
        if reference.uid.as_deref() == Some(self.instance.uid.as_str()) {
            return Ok(self.instance.clone());
        }
        self.resolver
            .resolve(reference)
            .ok_or_else(|| DispatchError::UnknownDatasource(reference.clone()))
    }

    /// Dispatch `request`
    ///
    /// Fails only when a query references a datasource that cannot be
    /// resolved. The backend is called when the stream is first polled.
    pub fn dispatch(&self, request: QueryRequest) -> DispatchResult<ResultStream> {
        let Some(call) = self.prepare(&request)? else {
            debug!(request_id = %request.request_id, "No queries left, skipping backend call");
            return Ok(one_shot(QueryResult::empty()));
        };

        info!(
            request_id = %call.request_id,
            datasource = %self.instance.uid,
            queries = call.body.queries.len(),
            "Dispatching query"
        );

        let transport = self.transport.clone();
        let merger = self.merger.clone();
        let provider = self.stream_options;

        Ok(async_stream::stream! {
            let queries = call.body.queries.clone();
            let result = match transport.query(call).await {
                Ok(raw) => normalize(&raw, Some(queries.as_slice())),
                Err(e) if e.is_cancelled() => {
                    debug!(request_id = %request.request_id, "Query cancelled");
                    return;
                }
                Err(e) => {
                    warn!(request_id = %request.request_id, error = %e, "Query failed");
                    // Failures are terminal: channel frames in an error body stay static
                    yield failure_result(&e, &queries);
                    return;
                }
            };

            if result.has_channel_frames() {
                let mut merged = merger.merge(result, &request, provider);
                while let Some(item) = merged.next().await {
                    yield item;
                }
            } else {
                yield result;
            }
        }
        .boxed())
    }
}

/// Terminal result for a failed backend call
///
/// An HTTP failure body is normalized like a regular response, so per-query
/// errors and partial frames it carries are kept.
fn failure_result(err: &TransportError, queries: &[Query]) -> QueryResult {
    let mut result = match err.as_raw_response() {
        Some(raw) => normalize(&raw, Some(queries)),
        None => QueryResult::empty(),
    };
    if !result.is_error() {
        result.record_error(classify_transport(err));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for, MockTransport, RecordingLiveService};
    use chrono::{Duration, TimeZone, Utc};
    use dsq_core::backend::DATASOURCE_UID_HEADER;
    use dsq_core::{
        DataFrame, DataSourceRegistry, Field, FieldType, LoadingState, RawBackendResponse,
        StreamingFrameAction, StreamingFrameOptions, TimeRange,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn prometheus() -> DataSourceInstance {
        DataSourceInstance::new(1, "prom-1", "Metrics", "prometheus")
    }

    fn registry() -> Arc<DataSourceRegistry> {
        Arc::new(DataSourceRegistry::from_instances([
            prometheus(),
            DataSourceInstance::new(2, "loki-1", "Logs", "loki"),
        ]))
    }

    fn frame_json(ref_id: Option<&str>) -> Value {
        let mut schema = json!({"fields": [{"name": "v", "type": "number"}]});
        if let Some(r) = ref_id {
            schema["refId"] = json!(r);
        }
        json!({"schema": schema, "data": {"values": [[1, 2]]}})
    }

    fn dispatcher(transport: Arc<MockTransport>) -> QueryDispatcher {
        QueryDispatcher::new(prometheus(), registry(), transport)
    }

    #[test]
    fn request_limits_replace_query_limits() {
        let transport = Arc::new(MockTransport::new());
        let mut query = Query::new("A");
        query.interval_ms = Some(60_000);
        query.max_data_points = Some(50);

        let call = dispatcher(transport)
            .prepare(&QueryRequest::new(vec![query]).with_interval_ms(1_000))
            .unwrap()
            .unwrap();
        let a = &call.body.queries[0];
        assert_eq!(a.interval_ms, Some(1_000));
        assert_eq!(a.max_data_points, None);
    }

    #[test]
    fn prepare_stamps_datasource_and_limits() {
        let transport = Arc::new(MockTransport::new());
        let request = QueryRequest::new(vec![
            Query::new("A"),
            Query::new("B").with_datasource(DataSourceRef::uid("loki-1")),
        ])
        .with_request_id("Q7")
        .with_interval_ms(15_000)
        .with_max_data_points(300);

        let call = dispatcher(transport).prepare(&request).unwrap().unwrap();
        assert_eq!(call.request_id, "Q7");
        assert_eq!(call.datasource_type.as_deref(), Some("prometheus"));
        assert_eq!(call.datasource_uid, None);
        assert!(!call.has_expression);

        let a = &call.body.queries[0];
        assert_eq!(a.datasource, Some(DataSourceRef::new("prometheus", "prom-1")));
        assert_eq!(a.datasource_id, Some(1));
        assert_eq!(a.interval_ms, Some(15_000));
        assert_eq!(a.max_data_points, Some(300));

        let b = &call.body.queries[1];
        assert_eq!(b.datasource, Some(DataSourceRef::new("loki", "loki-1")));
        assert_eq!(b.datasource_id, Some(2));
    }

    #[test]
    fn prepare_single_datasource_sets_uid_hint() {
        let transport = Arc::new(MockTransport::new());
        let request = QueryRequest::new(vec![Query::new("A"), Query::new("B")]);
        let call = dispatcher(transport).prepare(&request).unwrap().unwrap();
        assert_eq!(call.datasource_uid.as_deref(), Some("prom-1"));
        assert!(call
            .headers()
            .contains(&(DATASOURCE_UID_HEADER, "prom-1".to_string())));
    }

    #[test]
    fn expression_queries_pass_through() {
        let transport = Arc::new(MockTransport::new());
        let expr = Query::new("C")
            .with_datasource(DataSourceRef::named("Expression"))
            .with_field("expression", json!("$A * 2"));
        let request = QueryRequest::new(vec![Query::new("A"), expr]).with_max_data_points(10);

        let call = dispatcher(transport).prepare(&request).unwrap().unwrap();
        assert!(call.has_expression);
        let c = &call.body.queries[1];
        assert_eq!(c.datasource, Some(DataSourceRef::expression()));
        assert_eq!(c.datasource_id, None);
        assert_eq!(c.max_data_points, None);
        assert_eq!(c.model["expression"], json!("$A * 2"));
    }

    #[test]
    fn unknown_datasource_fails_synchronously() {
        let transport = Arc::new(MockTransport::new());
        let request = QueryRequest::new(vec![
            Query::new("A").with_datasource(DataSourceRef::uid("missing")),
        ]);

        let err = dispatcher(transport.clone()).dispatch(request).err().unwrap();
        assert!(matches!(
            err,
            DispatchError::UnknownDatasource(ref r) if r.uid.as_deref() == Some("missing")
        ));
        assert_eq!(err.to_string(), r#"Unknown Datasource: {"uid":"missing"}"#);
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn template_hook_only_applies_to_own_datasource() {
        let transport = Arc::new(MockTransport::new());
        let hooks = DataSourceHooks::new().with_template_variables(|query, vars| {
            let job = vars.get("job").cloned().unwrap_or(Value::Null);
            query.with_field("job", job)
        });
        let mut request = QueryRequest::new(vec![
            Query::new("A"),
            Query::new("B").with_datasource(DataSourceRef::uid("loki-1")),
        ]);
        request.scoped_vars.insert("job".into(), json!("api"));

        let call = dispatcher(transport)
            .with_hooks(hooks)
            .prepare(&request)
            .unwrap()
            .unwrap();
        assert_eq!(call.body.queries[0].model["job"], json!("api"));
        assert!(!call.body.queries[1].model.contains_key("job"));
    }

    #[tokio::test]
    async fn filtered_to_zero_never_calls_backend() {
        let transport = Arc::new(MockTransport::new());
        let hooks = DataSourceHooks::new().with_filter(|q| q.hide != Some(true));
        let mut hidden = Query::new("A");
        hidden.hide = Some(true);

        let results: Vec<_> = dispatcher(transport.clone())
            .with_hooks(hooks)
            .dispatch(QueryRequest::new(vec![hidden]))
            .unwrap()
            .collect()
            .await;

        assert_eq!(results, vec![QueryResult::empty()]);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn success_is_normalized_with_sent_queries() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(Ok(RawBackendResponse::ok(json!({
            "results": {
                "A": {"frames": [frame_json(None)]},
                "B": {"frames": [frame_json(Some("B"))]},
                "Z": {"frames": [frame_json(None)]}
            }
        }))));

        let range = TimeRange::absolute(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
        );
        let request = QueryRequest::new(vec![Query::new("A"), Query::new("B")]).with_range(range);
        let results: Vec<_> = dispatcher(transport.clone())
            .dispatch(request)
            .unwrap()
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        let ref_ids: Vec<_> = results[0].data.iter().map(|f| f.ref_id.clone().unwrap()).collect();
        assert_eq!(ref_ids, vec!["A", "B"]);
        assert_eq!(results[0].state(), LoadingState::Done);

        let calls = transport.calls();
        assert_eq!(calls[0].body.from.as_deref(), Some("1704067200000"));
        assert_eq!(calls[0].body.to.as_deref(), Some("1704070800000"));
    }

    #[tokio::test]
    async fn http_failure_becomes_error_result() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(Err(TransportError::Http {
            status: 500,
            status_text: "Internal".into(),
            data: None,
        }));

        let results: Vec<_> = dispatcher(transport)
            .dispatch(QueryRequest::new(vec![Query::new("A")]))
            .unwrap()
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].state(), LoadingState::Error);
        assert!(results[0].data.is_empty());
        assert_eq!(results[0].error().unwrap().message, "Query error: 500 Internal");
    }

    #[tokio::test]
    async fn http_failure_keeps_per_query_errors() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(Err(TransportError::Http {
            status: 400,
            status_text: "Bad Request".into(),
            data: Some(json!({"results": {"A": {"error": "parse error at line 1"}}})),
        }));

        let results: Vec<_> = dispatcher(transport)
            .dispatch(QueryRequest::new(vec![Query::new("A")]))
            .unwrap()
            .collect()
            .await;

        let error = results[0].error().unwrap();
        assert_eq!(error.ref_id.as_deref(), Some("A"));
        assert_eq!(error.message, "parse error at line 1");
    }

    #[tokio::test]
    async fn network_failure_becomes_error_result() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(Err(TransportError::Network("connection refused".into())));

        let results: Vec<_> = dispatcher(transport)
            .dispatch(QueryRequest::new(vec![Query::new("A")]))
            .unwrap()
            .collect()
            .await;

        assert_eq!(results[0].state(), LoadingState::Error);
        assert_eq!(
            results[0].error().unwrap().message,
            "Network error: connection refused"
        );
    }

    #[tokio::test]
    async fn cancelled_call_ends_without_result() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(Err(TransportError::Cancelled));

        let results: Vec<_> = dispatcher(transport)
            .dispatch(QueryRequest::new(vec![Query::new("A")]))
            .unwrap()
            .collect()
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn http_failure_with_channel_frame_stays_terminal() {
        let transport = Arc::new(MockTransport::new());
        let mut live_frame = frame_json(None);
        live_frame["schema"]["meta"] = json!({"channel": "ds/prom-1/rate"});
        transport.push_response(Err(TransportError::Http {
            status: 500,
            status_text: "Internal".into(),
            data: Some(json!({"results": {"A": {"frames": [live_frame]}}})),
        }));
        let live = Arc::new(RecordingLiveService::new());

        let results: Vec<_> = dispatcher(transport)
            .with_live_service(live.clone())
            .dispatch(QueryRequest::new(vec![Query::new("A")]))
            .unwrap()
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].state(), LoadingState::Error);
        assert_eq!(results[0].data.len(), 1);
        assert!(live.requests().is_empty());
        assert_eq!(live.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn channel_frames_are_upgraded_to_live_streams() {
        let transport = Arc::new(MockTransport::new());
        let mut live_frame = frame_json(None);
        live_frame["schema"]["meta"] = json!({"channel": "ds/prom-1/rate"});
        transport.push_response(Ok(RawBackendResponse::ok(json!({
            "results": {"A": {"frames": [frame_json(None), live_frame]}}
        }))));
        let live = Arc::new(RecordingLiveService::new());

        let request = QueryRequest::new(vec![Query::new("A")])
            .with_range(TimeRange::last(Duration::minutes(5), Utc::now()));
        let mut stream = dispatcher(transport)
            .with_live_service(live.clone())
            .dispatch(request)
            .unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.data.len(), 1);
        assert_eq!(first.data[0].channel(), None);

        let requests = live.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].buffer.max_delta, Some(300_000));

        let update = DataFrame::new(vec![Field::new("v", FieldType::Number, vec![json!(3)])]);
        live.send("ds/prom-1/rate", update.clone());
        let second = stream.next().await.unwrap();
        assert_eq!(second.data, vec![update]);

        drop(stream);
        assert_eq!(live.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn custom_stream_options_provider() {
        fn keep_last(_: &QueryRequest, _: &DataFrame) -> StreamingFrameOptions {
            StreamingFrameOptions {
                max_length: 1,
                max_delta: None,
                action: StreamingFrameAction::Replace,
            }
        }

        let transport = Arc::new(MockTransport::new());
        let mut live_frame = frame_json(None);
        live_frame["schema"]["meta"] = json!({"channel": "ds/prom-1/rate"});
        transport.push_response(Ok(RawBackendResponse::ok(json!({
            "results": {"A": {"frames": [live_frame]}}
        }))));
        let live = Arc::new(RecordingLiveService::new());

        let mut stream = dispatcher(transport)
            .with_live_service(live.clone())
            .with_stream_options(keep_last)
            .dispatch(QueryRequest::new(vec![Query::new("A")]))
            .unwrap();
        let next = tokio::spawn(async move { stream.next().await });

        let subscribed = {
            let live = live.clone();
            wait_for(
                move || {
                    let live = live.clone();
                    async move { !live.requests().is_empty() }
                },
                std::time::Duration::from_secs(2),
            )
            .await
        };
        assert!(subscribed);
        assert_eq!(live.requests()[0].buffer.max_length, 1);
        assert_eq!(live.requests()[0].buffer.action, StreamingFrameAction::Replace);

        live.send("ds/prom-1/rate", DataFrame::new(vec![]));
        let update = next.await.unwrap().unwrap();
        assert_eq!(update.key.as_deref(), Some("ds/prom-1/rate"));
    }
}
