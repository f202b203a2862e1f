//! Upgrade of a query result into a live result stream

use std::sync::Arc;

use dsq_core::{
    partition, LiveDataStreamRequest, LiveService, QueryRequest, QueryResult, ResultStream,
    StreamOptionsProvider,
};
use futures::stream::{self, StreamExt};
use tracing::debug;

/// A stream emitting `result` once
pub fn one_shot(result: QueryResult) -> ResultStream {
    stream::once(async move { result }).boxed()
}

/// Combines the static part of a result with its live channel subscriptions
#[derive(Clone, Default)]
pub struct StreamMerger {
    live: Option<Arc<dyn LiveService>>,
}

impl std::fmt::Debug for StreamMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMerger")
            .field("live", &self.live.is_some())
            .finish()
    }
}

impl StreamMerger {
    /// Merger without a live service; results pass through unchanged
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_live_service(live: Arc<dyn LiveService>) -> Self {
        Self { live: Some(live) }
    }

    pub fn has_live_service(&self) -> bool {
        self.live.is_some()
    }

    /// Turn `result` into a stream
    ///
    /// Channel frames are replaced by live subscriptions. Values from every
    /// constituent are forwarded as they arrive, and dropping the returned
    /// stream drops all subscriptions.
    pub fn merge(
        &self,
        result: QueryResult,
        request: &QueryRequest,
        options_provider: StreamOptionsProvider,
    ) -> ResultStream {
        let Some(live) = &self.live else {
            return one_shot(result);
        };

        let parts = partition(&result);
        if !parts.has_channels() {
            return one_shot(result);
        }

        let mut streams = Vec::with_capacity(parts.channel_frames.len() + 1);
        if !parts.static_frames.is_empty() {
            streams.push(one_shot(result.with_data(parts.static_frames)));
        }

        for channel in parts.channel_frames {
            debug!(
                request_id = %request.request_id,
                channel = %channel.address,
                "Subscribing to live channel"
            );
            let buffer = options_provider(request, &channel.frame);
            streams.push(live.get_data_stream(LiveDataStreamRequest {
                address: channel.address,
                buffer,
                frame: channel.frame,
            }));
        }

        if streams.len() == 1 {
            if let Some(only) = streams.pop() {
                return only;
            }
        }
        stream::select_all(streams).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingLiveService;
    use dsq_core::{standard_stream_options_provider, DataFrame, Field, FieldType, LoadingState};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn frame(name: &str) -> DataFrame {
        DataFrame::new(vec![Field::new("v", FieldType::Number, vec![json!(1)])])
            .with_name(name)
            .with_ref_id("A")
    }

    #[tokio::test]
    async fn no_live_service_passes_result_through() {
        let result = QueryResult::done(vec![frame("a").with_channel("ds/scope/path")]);
        let merger = StreamMerger::new();

        let out: Vec<_> = merger
            .merge(result.clone(), &QueryRequest::new(vec![]), standard_stream_options_provider)
            .collect()
            .await;
        assert_eq!(out, vec![result]);
    }

    #[tokio::test]
    async fn no_channels_never_calls_live_service() {
        let live = Arc::new(RecordingLiveService::new());
        let merger = StreamMerger::with_live_service(live.clone());
        let result = QueryResult::done(vec![frame("a"), frame("b")]);

        let out: Vec<_> = merger
            .merge(result.clone(), &QueryRequest::new(vec![]), standard_stream_options_provider)
            .collect()
            .await;
        assert_eq!(out, vec![result]);
        assert!(live.requests().is_empty());
    }

    #[tokio::test]
    async fn channel_frames_become_subscriptions() {
        let live = Arc::new(RecordingLiveService::new());
        let merger = StreamMerger::with_live_service(live.clone());
        let request = QueryRequest::new(vec![]).with_max_data_points(42);
        let result = QueryResult::done(vec![
            frame("static"),
            frame("live").with_channel("ds/uid/metrics"),
        ]);

        let mut merged = merger.merge(result, &request, standard_stream_options_provider);
        let first = merged.next().await.unwrap();
        assert_eq!(first.data.len(), 1);
        assert_eq!(first.data[0].name.as_deref(), Some("static"));
        assert_eq!(first.state(), LoadingState::Done);

        let requests = live.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].address.channel_id(), "ds/uid/metrics");
        assert_eq!(requests[0].buffer.max_length, 42);
        assert_eq!(requests[0].frame.name.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn single_channel_stream_is_returned_directly() {
        let live = Arc::new(RecordingLiveService::new());
        let merger = StreamMerger::with_live_service(live.clone());
        let result = QueryResult::done(vec![frame("live").with_channel("ds/uid/metrics")]);

        let mut merged = merger.merge(
            result,
            &QueryRequest::new(vec![]),
            standard_stream_options_provider,
        );
        live.send("ds/uid/metrics", frame("update"));
        let update = merged.next().await.unwrap();
        assert_eq!(update.key.as_deref(), Some("ds/uid/metrics"));
        assert_eq!(update.state(), LoadingState::Streaming);
    }

    #[test]
    fn live_stream_waits_for_updates() {
        let live = Arc::new(RecordingLiveService::new());
        let merger = StreamMerger::with_live_service(live.clone());
        let result = QueryResult::done(vec![frame("live").with_channel("ds/uid/metrics")]);

        let mut task = tokio_test::task::spawn(merger.merge(
            result,
            &QueryRequest::new(vec![]),
            standard_stream_options_provider,
        ));
        tokio_test::assert_pending!(task.poll_next());

        live.send("ds/uid/metrics", frame("update"));
        assert!(task.is_woken());
        let update = tokio_test::assert_ready!(task.poll_next()).unwrap();
        assert_eq!(update.data[0].name.as_deref(), Some("update"));
        tokio_test::assert_pending!(task.poll_next());
    }

    #[tokio::test]
    async fn dropping_merged_stream_closes_subscriptions() {
        let live = Arc::new(RecordingLiveService::new());
        let merger = StreamMerger::with_live_service(live.clone());
        let result = QueryResult::done(vec![
            frame("a").with_channel("ds/uid/one"),
            frame("b").with_channel("ds/uid/two"),
        ]);

        let merged = merger.merge(
            result,
            &QueryRequest::new(vec![]),
            standard_stream_options_provider,
        );
        assert_eq!(live.open_subscriptions(), 2);
        drop(merged);
        assert_eq!(live.open_subscriptions(), 0);
    }
}
