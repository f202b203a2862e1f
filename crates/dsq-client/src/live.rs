//! In-process live channel hub
//!
//! [`LocalLiveHub`] implements [`LiveService`] on top of tokio broadcast
//! channels, one per channel id. Producers call [`LocalLiveHub::publish`];
//! every subscription buffers the published frames into its own
//! [`StreamingFrame`] and emits the buffer after each update.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use dsq_core::{
    DataFrame, LiveChannelAddress, LiveDataStreamRequest, LiveService, LoadingState, QueryResult,
    ResultStream, StreamingFrame,
};
use futures::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Updates queued per channel before slow subscribers start lagging
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

type Channels = Arc<RwLock<HashMap<String, broadcast::Sender<DataFrame>>>>;

/// Broadcast hub for live channel updates
#[derive(Debug, Clone)]
pub struct LocalLiveHub {
    channels: Channels,
    capacity: usize,
}

impl Default for LocalLiveHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLiveHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Publish `frame` to every subscriber of `address`
    ///
    /// Returns the number of subscribers reached. Frames published to a
    /// channel nobody listens to are dropped.
    pub fn publish(&self, address: &LiveChannelAddress, frame: DataFrame) -> usize {
        let channels = self.channels.read();
        match channels.get(&address.channel_id()) {
            Some(sender) => sender.send(frame).unwrap_or(0),
            None => 0,
        }
    }

    /// Number of open subscriptions on `address`
    pub fn subscriber_count(&self, address: &LiveChannelAddress) -> usize {
        self.channels
            .read()
            .get(&address.channel_id())
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Ids of channels with at least one subscriber
    pub fn channels(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.channels.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn subscribe(&self, channel_id: &str) -> broadcast::Receiver<DataFrame> {
        let mut channels = self.channels.write();
        channels
            .entry(channel_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl LiveService for LocalLiveHub {
    fn get_data_stream(&self, request: LiveDataStreamRequest) -> ResultStream {
        let channel_id = request.address.channel_id();
        debug!(channel = %channel_id, "Opening live subscription");
        let receiver = self.subscribe(&channel_id);

        ChannelSubscription {
            updates: BroadcastStream::new(receiver),
            buffer: StreamingFrame::new(request.frame, request.buffer),
            channels: self.channels.clone(),
            channel_id,
        }
        .boxed()
    }
}

/// One subscriber's view of a channel
///
/// Deregisters the channel from the hub when the last subscriber drops.
struct ChannelSubscription {
    updates: BroadcastStream<DataFrame>,
    buffer: StreamingFrame,
    channels: Channels,
    channel_id: String,
}

impl Stream for ChannelSubscription {
    type Item = QueryResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            match ready!(this.updates.poll_next_unpin(cx)) {
                Some(Ok(frame)) => {
                    this.buffer.push(frame);
                    let result = QueryResult::done(vec![this.buffer.frame().clone()])
                        .with_state(LoadingState::Streaming)
                        .with_key(this.channel_id.clone());
                    return Poll::Ready(Some(result));
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(
                        channel = %this.channel_id,
                        skipped,
                        "Live subscriber lagged, updates dropped"
                    );
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        let mut channels = self.channels.write();
        // Our own receiver is still alive here
        if channels
            .get(&self.channel_id)
            .is_some_and(|sender| sender.receiver_count() <= 1)
        {
            debug!(channel = %self.channel_id, "Closing live channel");
            channels.remove(&self.channel_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsq_core::{Field, FieldType, StreamingFrameOptions};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn address() -> LiveChannelAddress {
        LiveChannelAddress::new("ds", "uid", "cpu")
    }

    fn rows(times: &[i64], values: &[f64]) -> DataFrame {
        DataFrame::new(vec![
            Field::new("Time", FieldType::Time, times.iter().map(|t| json!(t)).collect()),
            Field::new("Value", FieldType::Number, values.iter().map(|v| json!(v)).collect()),
        ])
    }

    fn request(options: StreamingFrameOptions) -> LiveDataStreamRequest {
        LiveDataStreamRequest {
            address: address(),
            buffer: options,
            frame: rows(&[1000], &[1.0]).with_ref_id("A"),
        }
    }

    #[tokio::test]
    async fn updates_are_buffered_and_emitted() {
        let hub = LocalLiveHub::new();
        let mut stream = hub.get_data_stream(request(StreamingFrameOptions::default()));

        assert_eq!(hub.publish(&address(), rows(&[2000], &[2.0])), 1);
        let result = stream.next().await.unwrap();

        assert_eq!(result.state(), LoadingState::Streaming);
        assert_eq!(result.key.as_deref(), Some("ds/uid/cpu"));
        let frame = &result.data[0];
        assert_eq!(frame.ref_id.as_deref(), Some("A"));
        assert_eq!(frame.fields[0].values, vec![json!(1000), json!(2000)]);
    }

    #[tokio::test]
    async fn buffer_respects_max_length() {
        let hub = LocalLiveHub::new();
        let options = StreamingFrameOptions {
            max_length: 2,
            ..Default::default()
        };
        let mut stream = hub.get_data_stream(request(options));

        hub.publish(&address(), rows(&[2000, 3000], &[2.0, 3.0]));
        let result = stream.next().await.unwrap();
        assert_eq!(result.data[0].fields[1].values, vec![json!(2.0), json!(3.0)]);
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let hub = LocalLiveHub::new();
        assert_eq!(hub.publish(&address(), rows(&[1], &[1.0])), 0);
        assert!(hub.channels().is_empty());
    }

    #[tokio::test]
    async fn dropping_last_subscriber_closes_channel() {
        let hub = LocalLiveHub::new();
        let first = hub.get_data_stream(request(StreamingFrameOptions::default()));
        let second = hub.get_data_stream(request(StreamingFrameOptions::default()));
        assert_eq!(hub.subscriber_count(&address()), 2);
        assert_eq!(hub.channels(), vec!["ds/uid/cpu".to_string()]);

        drop(first);
        assert_eq!(hub.subscriber_count(&address()), 1);
        drop(second);
        assert_eq!(hub.subscriber_count(&address()), 0);
        assert!(hub.channels().is_empty());
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_to_latest() {
        let hub = LocalLiveHub::with_capacity(1);
        let mut stream = hub.get_data_stream(request(StreamingFrameOptions {
            action: dsq_core::StreamingFrameAction::Replace,
            ..Default::default()
        }));

        hub.publish(&address(), rows(&[2000], &[2.0]));
        hub.publish(&address(), rows(&[3000], &[3.0]));
        let result = stream.next().await.unwrap();
        assert_eq!(result.data[0].fields[0].values, vec![json!(3000)]);
    }
}
