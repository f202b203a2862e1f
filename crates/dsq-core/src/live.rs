//! Live channel addressing and routing
//!
//! A frame whose `meta.channel` parses as `scope/namespace/path` is an
//! invitation to subscribe to that channel rather than a finished result.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{DataFrame, QueryRequest, QueryResult};

/// Address of a live channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LiveChannelAddress {
    /// Channel scope, e.g. `ds`, `plugin`, `grafana` or `stream`
    pub scope: String,
    /// Scope-specific namespace, e.g. a datasource uid
    pub namespace: String,
    /// Remaining path; may itself contain `/`
    pub path: String,
}

impl LiveChannelAddress {
    pub fn new(
        scope: impl Into<String>,
        namespace: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            namespace: namespace.into(),
            path: path.into(),
        }
    }

    /// Parse a channel id, returning `None` when it is not a valid address
    ///
    /// ```
    /// # use dsq_core::live::LiveChannelAddress;
    /// let addr = LiveChannelAddress::parse("ds/abc/cpu/total").unwrap();
    /// assert_eq!(addr.namespace, "abc");
    /// assert_eq!(addr.path, "cpu/total");
    /// assert!(LiveChannelAddress::parse("ds/abc").is_none());
    /// assert!(LiveChannelAddress::parse("ds//cpu").is_none());
    /// ```
    pub fn parse(id: &str) -> Option<Self> {
        let mut parts = id.trim().splitn(3, '/');
        let scope = parts.next()?;
        let namespace = parts.next()?;
        let path = parts.next()?;

        if scope.is_empty() || namespace.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self::new(scope, namespace, path))
    }

    /// The channel id this address was parsed from
    pub fn channel_id(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for LiveChannelAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.namespace, self.path)
    }
}

impl FromStr for LiveChannelAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Invalid live channel address: '{}'", s))
    }
}

/// A frame routed to a live channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFrame {
    pub frame: DataFrame,
    pub address: LiveChannelAddress,
}

/// Frames of a result split by whether they address a live channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub static_frames: Vec<DataFrame>,
    pub channel_frames: Vec<ChannelFrame>,
}

impl Partition {
    /// Whether streaming is needed at all
    pub fn has_channels(&self) -> bool {
        !self.channel_frames.is_empty()
    }
}

/// Split a result into static and channel-addressed frames
///
/// Frames whose channel id does not parse are treated as static.
pub fn partition(result: &QueryResult) -> Partition {
    let mut out = Partition::default();
    for frame in &result.data {
        match frame.channel().and_then(LiveChannelAddress::parse) {
            Some(address) => out.channel_frames.push(ChannelFrame {
                frame: frame.clone(),
                address,
            }),
            None => out.static_frames.push(frame.clone()),
        }
    }
    out
}

/// How a live update is combined with the frame already buffered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingFrameAction {
    /// Add the update's rows after the buffered rows
    #[default]
    Append,
    /// Replace the buffered rows with the update
    Replace,
}

/// Buffering policy for one live channel subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingFrameOptions {
    /// Maximum number of rows kept
    pub max_length: usize,
    /// Maximum age of rows kept, in milliseconds, relative to the newest row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delta: Option<i64>,
    pub action: StreamingFrameAction,
}

/// Rows kept per channel when the request does not ask for a limit
pub const DEFAULT_MAX_LENGTH: usize = 500;

impl Default for StreamingFrameOptions {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            max_delta: None,
            action: StreamingFrameAction::Append,
        }
    }
}

/// Computes the buffering policy for a channel frame
///
/// A plain function pointer: providers cannot carry per-call state, so
/// concurrent dispatches never interfere through them.
pub type StreamOptionsProvider = fn(&QueryRequest, &DataFrame) -> StreamingFrameOptions;

/// Default provider
///
/// Keeps `max_data_points` rows (500 when unset) in append mode, and when the
/// range ends at "now" clamps the buffer to the width of the visible window.
pub fn standard_stream_options_provider(
    request: &QueryRequest,
    _frame: &DataFrame,
) -> StreamingFrameOptions {
    let max_delta = request
        .range
        .as_ref()
        .filter(|range| range.is_live())
        .map(|range| range.span_ms());

    StreamingFrameOptions {
        max_length: request
            .max_data_points
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_LENGTH),
        max_delta,
        action: StreamingFrameAction::Append,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataQueryError, TimeRange};
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn parse_requires_three_segments() {
        assert_eq!(
            LiveChannelAddress::parse("ds/scope/path"),
            Some(LiveChannelAddress::new("ds", "scope", "path"))
        );
        assert_eq!(LiveChannelAddress::parse(""), None);
        assert_eq!(LiveChannelAddress::parse("ds"), None);
        assert_eq!(LiveChannelAddress::parse("ds/scope/"), None);
        assert_eq!(LiveChannelAddress::parse("/scope/path"), None);
    }

    #[test]
    fn parse_trims_whitespace() {
        let addr = LiveChannelAddress::parse("  plugin/testdata/random-2s-stream \n").unwrap();
        assert_eq!(addr.channel_id(), "plugin/testdata/random-2s-stream");
    }

    #[test]
    fn from_str_reports_bad_input() {
        assert!("grafana/dashboard".parse::<LiveChannelAddress>().is_err());
        assert!("grafana/dashboard/uid/abc".parse::<LiveChannelAddress>().is_ok());
    }

    #[test]
    fn partition_routes_by_channel() {
        let result = QueryResult::done(vec![
            DataFrame::default().with_ref_id("A"),
            DataFrame::default().with_ref_id("B").with_channel("ds/scope/path"),
            DataFrame::default().with_ref_id("C").with_channel("not-a-channel"),
        ]);
        let parts = partition(&result);

        assert!(parts.has_channels());
        assert_eq!(parts.static_frames.len(), 2);
        assert_eq!(parts.channel_frames.len(), 1);
        assert_eq!(parts.channel_frames[0].frame.ref_id.as_deref(), Some("B"));
        assert_eq!(parts.channel_frames[0].address.path, "path");
    }

    #[test]
    fn partition_ignores_result_state() {
        let result = QueryResult::failed(
            vec![DataFrame::default().with_channel("ds/a/b")],
            DataQueryError::new("partial"),
        );
        assert_eq!(partition(&result).channel_frames.len(), 1);
    }

    #[test]
    fn standard_options_defaults() {
        let request = QueryRequest::new(vec![]);
        let opts = standard_stream_options_provider(&request, &DataFrame::default());
        assert_eq!(opts, StreamingFrameOptions::default());
    }

    #[test]
    fn standard_options_live_range() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let request = QueryRequest::new(vec![])
            .with_max_data_points(1200)
            .with_range(TimeRange::last(Duration::minutes(5), now));
        let opts = standard_stream_options_provider(&request, &DataFrame::default());

        assert_eq!(opts.max_length, 1200);
        assert_eq!(opts.max_delta, Some(300_000));
        assert_eq!(opts.action, StreamingFrameAction::Append);
    }

    #[test]
    fn standard_options_fixed_range_has_no_delta() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let request = QueryRequest::new(vec![])
            .with_range(TimeRange::absolute(now - Duration::minutes(5), now));
        let opts = standard_stream_options_provider(&request, &DataFrame::default());
        assert_eq!(opts.max_delta, None);
    }
}
